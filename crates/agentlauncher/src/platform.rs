use std::fmt;

use crate::error::PlatformError;

/// MeshCentral agent build flavor, sent as `?id=` on the binary download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VariantId(pub u32);

impl fmt::Display for VariantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Windows,
    Linux,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformDescriptor {
    pub os: String,
    pub arch: String,
}

impl PlatformDescriptor {
    pub fn host() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Variant {
    pub id: VariantId,
    pub os: OsFamily,
}

impl Variant {
    /// File name the agent binary is stored under, decided here so the
    /// supervisor never has to guess which directory entry to execute.
    pub fn binary_name(&self) -> &'static str {
        match self.os {
            OsFamily::Windows => "meshagent.exe",
            OsFamily::Linux => "meshagent",
        }
    }
}

pub fn resolve(platform: &PlatformDescriptor) -> Result<Variant, PlatformError> {
    let os = platform.os.trim().to_ascii_lowercase();
    let arch = platform.arch.trim().to_ascii_lowercase();

    let (family, id) = match (os.as_str(), arch.as_str()) {
        ("windows" | "win32", "x86" | "i386" | "i686" | "ia32") => (OsFamily::Windows, 3),
        ("windows" | "win32", "x86_64" | "x64" | "amd64") => (OsFamily::Windows, 4),
        ("linux", "x86" | "i386" | "i686" | "ia32") => (OsFamily::Linux, 5),
        ("linux", "x86_64" | "x64" | "amd64") => (OsFamily::Linux, 6),
        ("linux", "arm" | "armv7" | "armv6") => (OsFamily::Linux, 25),
        ("linux", "aarch64" | "arm64") => (OsFamily::Linux, 26),
        _ => {
            return Err(PlatformError::Unsupported {
                os: platform.os.clone(),
                arch: platform.arch.clone(),
            });
        }
    };

    Ok(Variant {
        id: VariantId(id),
        os: family,
    })
}
