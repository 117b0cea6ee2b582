use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use futures_util::StreamExt;
use reqwest::Url;
use tokio::io::AsyncWriteExt;

use crate::error::FetchError;
use crate::platform::Variant;

pub const BINARY_ENDPOINT: &str = "meshagents";
pub const POLICY_ENDPOINT: &str = "meshsettings";
pub const POLICY_FILE: &str = "meshagent.msh";
const PART_SUFFIX: &str = ".part";

/// Canonical downloaded artifacts. Read-only once `ensure_artifacts` returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSet {
    pub root: PathBuf,
    pub binary: PathBuf,
    pub policy: PathBuf,
}

impl ArtifactSet {
    pub fn binary_name(&self) -> &str {
        self.binary
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub binary_downloaded: bool,
    pub policy_downloaded: bool,
}

/// MESHID as given on the command line: either the identifier itself or a
/// path to a file holding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshSelector(pub String);

impl MeshSelector {
    pub fn resolve(&self) -> Result<String, FetchError> {
        let path = Path::new(&self.0);
        if !path.is_file() {
            return Ok(self.0.clone());
        }

        let text = std::fs::read_to_string(path).map_err(|source| FetchError::MeshFile {
            path: path.to_path_buf(),
            source,
        })?;
        let id = text.trim();
        if id.is_empty() {
            return Err(FetchError::EmptyMeshFile(path.to_path_buf()));
        }
        Ok(id.to_string())
    }
}

pub fn http_client(timeout: Duration) -> Result<reqwest::Client, FetchError> {
    reqwest::Client::builder()
        .user_agent(concat!("agentlauncher/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
        .map_err(FetchError::Client)
}

pub fn endpoint_url(base: &Url, endpoint: &str, id: &str) -> Result<Url, FetchError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    let mut url = base
        .join(endpoint)
        .map_err(|e| FetchError::Url(format!("{base}{endpoint}: {e}")))?;
    url.query_pairs_mut().append_pair("id", id);
    Ok(url)
}

/// Makes sure the agent binary and policy file exist under `root`.
///
/// Fetch-once: an artifact already on disk is never re-downloaded. The mesh
/// selector is resolved before any network traffic so a bad MESHID file
/// fails without touching the server.
pub async fn ensure_artifacts(
    client: &reqwest::Client,
    server: &Url,
    variant: Variant,
    mesh: &MeshSelector,
    root: &Path,
) -> Result<(ArtifactSet, FetchReport), FetchError> {
    let mesh_id = mesh.resolve()?;

    tokio::fs::create_dir_all(root)
        .await
        .map_err(|source| FetchError::Write {
            path: root.to_path_buf(),
            source,
        })?;

    let set = ArtifactSet {
        root: root.to_path_buf(),
        binary: root.join(variant.binary_name()),
        policy: root.join(POLICY_FILE),
    };
    let mut report = FetchReport::default();

    if set.binary.exists() {
        tracing::debug!(path = %set.binary.display(), "agent binary cached, skipping download");
    } else {
        let url = endpoint_url(server, BINARY_ENDPOINT, &variant.id.to_string())?;
        tracing::info!(%url, variant = %variant.id, "downloading agent binary");
        let bytes = download_to(client, url, &set.binary, true).await?;
        tracing::info!(path = %set.binary.display(), bytes, "agent binary ready");
        report.binary_downloaded = true;
    }

    if set.policy.exists() {
        tracing::debug!(path = %set.policy.display(), "policy file cached, skipping download");
    } else {
        let url = endpoint_url(server, POLICY_ENDPOINT, &mesh_id)?;
        tracing::info!(%url, "downloading policy file");
        let bytes = download_to(client, url, &set.policy, false).await?;
        tracing::info!(path = %set.policy.display(), bytes, "policy file ready");
        report.policy_downloaded = true;
    }

    Ok((set, report))
}

pub fn is_partial_download(name: &str) -> bool {
    name.ends_with(PART_SUFFIX)
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(PART_SUFFIX);
    dest.with_file_name(name)
}

/// Streams `url` into `<dest>.part` and renames it into place. The final
/// name only ever appears on a complete file, already executable when
/// `executable` is set.
async fn download_to(
    client: &reqwest::Client,
    url: Url,
    dest: &Path,
    executable: bool,
) -> Result<u64, FetchError> {
    let part = part_path(dest);
    let transport = |source: reqwest::Error| FetchError::Transport {
        url: url.to_string(),
        source,
    };
    let write = |source: std::io::Error| FetchError::Write {
        path: part.clone(),
        source,
    };

    let res: Result<u64, FetchError> = async {
        let resp = client
            .get(url.clone())
            .send()
            .await
            .map_err(transport)?
            .error_for_status()
            .map_err(transport)?;

        let mut out = tokio::fs::File::create(&part).await.map_err(write)?;
        let mut total: u64 = 0;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(transport)?;
            total = total.saturating_add(chunk.len() as u64);
            out.write_all(&chunk).await.map_err(write)?;
        }
        out.flush().await.map_err(write)?;
        out.sync_all().await.map_err(write)?;
        drop(out);

        if executable {
            make_executable(&part).await?;
        }

        tokio::fs::rename(&part, dest)
            .await
            .map_err(|source| FetchError::Write {
                path: dest.to_path_buf(),
                source,
            })?;
        Ok(total)
    }
    .await;

    if res.is_err() {
        let _ = tokio::fs::remove_file(&part).await;
    }
    res
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<(), FetchError> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|source| FetchError::Write {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> Result<(), FetchError> {
    Ok(())
}
