use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;

/// Directory under the launcher root holding the canonical artifacts and
/// the numbered instance directories.
pub const AGENTS_DIR: &str = "agents";

const DEFAULT_HTTP_TIMEOUT_SEC: u64 = 300;
const DEFAULT_EARLY_EXIT_MS: u64 = 2000;
const DEFAULT_STOP_GRACE_SEC: u64 = 5;

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub root: PathBuf,
    pub http_timeout: Duration,
    pub early_exit: Duration,
    pub stop_grace: Duration,
}

impl LauncherConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let root = match std::env::var("AGENTLAUNCHER_ROOT") {
            Ok(raw) if !raw.trim().is_empty() => PathBuf::from(raw.trim()),
            _ => PathBuf::from("."),
        };
        let root = absolutize(&root).context("resolve AGENTLAUNCHER_ROOT")?;

        Ok(Self {
            root,
            http_timeout: Duration::from_secs(
                env_u64("AGENTLAUNCHER_HTTP_TIMEOUT_SEC")?
                    .map(|v| v.clamp(5, 3600))
                    .unwrap_or(DEFAULT_HTTP_TIMEOUT_SEC),
            ),
            early_exit: Duration::from_millis(
                env_u64("AGENTLAUNCHER_EARLY_EXIT_MS")?
                    .map(|v| v.clamp(100, 60_000))
                    .unwrap_or(DEFAULT_EARLY_EXIT_MS),
            ),
            stop_grace: Duration::from_secs(
                env_u64("AGENTLAUNCHER_STOP_GRACE_SEC")?
                    .map(|v| v.clamp(1, 60))
                    .unwrap_or(DEFAULT_STOP_GRACE_SEC),
            ),
        })
    }

    /// Config rooted at `root` with default timings.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SEC),
            early_exit: Duration::from_millis(DEFAULT_EARLY_EXIT_MS),
            stop_grace: Duration::from_secs(DEFAULT_STOP_GRACE_SEC),
        }
    }

    pub fn artifact_root(&self) -> PathBuf {
        self.root.join(AGENTS_DIR)
    }
}

fn env_u64(name: &str) -> anyhow::Result<Option<u64>> {
    match std::env::var(name) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => v
            .trim()
            .parse::<u64>()
            .map(Some)
            .with_context(|| format!("{name} must be a non-negative integer (got {v:?})")),
        Err(_) => Ok(None),
    }
}

fn absolutize(p: &Path) -> std::io::Result<PathBuf> {
    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()?.join(p)
    };
    // Best-effort canonicalization: the root may not exist yet.
    Ok(std::fs::canonicalize(&abs).unwrap_or(abs))
}
