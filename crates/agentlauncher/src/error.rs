use std::path::PathBuf;

use agentlauncher_process::InstanceId;

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("no action specified")]
    Empty,
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("action {0} requires a value")]
    MissingValue(&'static str),
    #[error("action {0} given more than once")]
    Duplicate(&'static str),
    #[error("missing required action {0}")]
    MissingAction(&'static str),
    #[error("CLEANUP cannot be combined with {0}")]
    CleanupExclusive(&'static str),
    #[error("invalid URL {value:?}: {reason}")]
    InvalidUrl { value: String, reason: String },
    #[error("AGENTS must be a positive integer (got {0:?})")]
    InvalidCount(String),
    #[error("MESHID must be a 64-character identifier or a .txt file (got {0:?})")]
    InvalidMeshId(String),
    #[error("MESHID file not found: {}", .0.display())]
    MeshFileMissing(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("unsupported platform: os={os} arch={arch}")]
    Unsupported { os: String, arch: String },
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("read MESHID file {}: {source}", path.display())]
    MeshFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("MESHID file {} is empty", .0.display())]
    EmptyMeshFile(PathBuf),
    #[error("invalid download URL: {0}")]
    Url(String),
    #[error("build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("download {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("list artifact root {}: {source}", path.display())]
    ListArtifacts {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("artifact root {} holds no files", .0.display())]
    NoArtifacts(PathBuf),
    #[error("instance {instance}: create {}: {source}", path.display())]
    CreateDir {
        instance: InstanceId,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("instance {instance}: copy {file}: {source}")]
    CopyFile {
        instance: InstanceId,
        file: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("instance {instance}: agent executable not found at {}", path.display())]
    NotFound { instance: InstanceId, path: PathBuf },
    #[error("instance {0} is already running")]
    AlreadyRunning(InstanceId),
    #[error("instance {0} is not registered")]
    Unknown(InstanceId),
    #[error("instance {instance}: spawn {}: {source}", exec.display())]
    Os {
        instance: InstanceId,
        exec: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    #[error("remove {}: {source}", path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Cleanup(#[from] CleanupError),
}

pub const EXIT_VALIDATION: u8 = 1;
pub const EXIT_PLATFORM: u8 = 2;
pub const EXIT_FETCH: u8 = 3;
pub const EXIT_RUNTIME: u8 = 4;
pub const EXIT_CONFIG: u8 = 5;

impl LaunchError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) => EXIT_VALIDATION,
            Self::Platform(_) => EXIT_PLATFORM,
            Self::Fetch(_) => EXIT_FETCH,
            Self::Directory(_) | Self::Spawn(_) | Self::Cleanup(_) => EXIT_RUNTIME,
        }
    }
}

/// Joins an error and its sources into one line, skipping repeats.
pub fn format_error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = Vec::<String>::new();
    let mut cur = Some(err);
    while let Some(e) = cur {
        let s = e.to_string();
        if !s.is_empty() && !parts.iter().any(|p| p.contains(&s)) {
            parts.push(s);
        }
        cur = e.source();
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}
