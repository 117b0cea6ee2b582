use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use agentlauncher_process::{BatchId, InstanceId};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

pub const RUN_FILE: &str = "run.json";

/// Spawn descriptor written next to each agent so an operator can tell
/// which batch and pid own an instance directory.
#[derive(Debug, Clone, Serialize)]
pub struct RunInfo {
    pub instance: InstanceId,
    pub batch: BatchId,
    pub started_at_unix_ms: u64,
    pub launcher_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub exec: String,
    pub args: Vec<String>,
    pub cwd: String,
    pub env: BTreeMap<String, String>,
}

impl RunInfo {
    pub fn new(instance: InstanceId, batch: &BatchId, exec: &Path, args: &[&str], cwd: &Path) -> Self {
        Self {
            instance,
            batch: batch.clone(),
            started_at_unix_ms: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            launcher_version: env!("CARGO_PKG_VERSION").to_string(),
            pid: None,
            exec: exec.display().to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: cwd.display().to_string(),
            env: collect_safe_env(),
        }
    }
}

fn collect_safe_env() -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for key in ["AGENTLAUNCHER_ROOT", "LD_LIBRARY_PATH", "PATH"] {
        if let Ok(v) = std::env::var(key) {
            let val = if key == "PATH" && v.len() > 512 {
                let mut end = 512;
                while !v.is_char_boundary(end) {
                    end -= 1;
                }
                format!("{}…(truncated)", &v[..end])
            } else {
                v
            };
            out.insert(key.to_string(), val);
        }
    }
    out
}

pub fn run_file(dir: &Path) -> PathBuf {
    dir.join(RUN_FILE)
}

pub async fn write_run_json(dir: &Path, info: &RunInfo) -> anyhow::Result<()> {
    use anyhow::Context;

    let path = run_file(dir);
    let tmp = dir.join("run.json.tmp");
    let data = serde_json::to_vec_pretty(info).context("serialize run.json")?;
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .context("create run.json.tmp")?;
    f.write_all(&data).await.context("write run.json.tmp")?;
    f.flush().await.ok();
    drop(f);
    tokio::fs::rename(&tmp, &path)
        .await
        .context("persist run.json")?;
    Ok(())
}
