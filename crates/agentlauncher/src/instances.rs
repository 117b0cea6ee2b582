use std::{
    fs,
    path::{Path, PathBuf},
};

use agentlauncher_process::InstanceId;

use crate::error::DirectoryError;
use crate::fetcher::is_partial_download;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstanceReport {
    pub created_dirs: usize,
    pub copied_files: usize,
    pub skipped_files: usize,
}

pub fn instance_dir(artifact_root: &Path, id: InstanceId) -> PathBuf {
    artifact_root.join(id.dir_name())
}

/// Regular files sitting directly in the artifact root, sorted by name.
///
/// Sub-directories are the instances themselves and are never part of the
/// canonical set.
fn canonical_files(artifact_root: &Path) -> Result<Vec<(String, PathBuf)>, DirectoryError> {
    let list_err = |source| DirectoryError::ListArtifacts {
        path: artifact_root.to_path_buf(),
        source,
    };

    let mut out = Vec::new();
    for entry in fs::read_dir(artifact_root).map_err(list_err)? {
        let entry = entry.map_err(list_err)?;
        if !entry.file_type().map_err(list_err)?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if is_partial_download(&name) || name.ends_with(COPY_TMP_SUFFIX) {
            continue;
        }
        out.push((name, entry.path()));
    }
    out.sort();
    Ok(out)
}

const COPY_TMP_SUFFIX: &str = ".copying";

/// Creates `count` instance directories under `artifact_root`, each holding
/// a copy of every canonical artifact.
///
/// Idempotent: files already present are left alone. Fail-fast: the first
/// directory or copy failure aborts and names the instance. Instances are
/// processed in ascending order so the failure point is deterministic.
pub fn ensure_instances(
    artifact_root: &Path,
    count: u32,
) -> Result<InstanceReport, DirectoryError> {
    let files = canonical_files(artifact_root)?;
    if files.is_empty() {
        return Err(DirectoryError::NoArtifacts(artifact_root.to_path_buf()));
    }

    let mut report = InstanceReport::default();
    for id in InstanceId::range(count) {
        let dir = instance_dir(artifact_root, id);
        if !dir.is_dir() {
            fs::create_dir_all(&dir).map_err(|source| DirectoryError::CreateDir {
                instance: id,
                path: dir.clone(),
                source,
            })?;
            report.created_dirs += 1;
        }

        for (name, src) in &files {
            let dst = dir.join(name);
            if dst.exists() {
                report.skipped_files += 1;
                continue;
            }
            copy_atomic(src, &dst).map_err(|source| DirectoryError::CopyFile {
                instance: id,
                file: name.clone(),
                source,
            })?;
            report.copied_files += 1;
        }
        tracing::debug!(instance = %id, dir = %dir.display(), "instance directory ready");
    }

    tracing::info!(
        count,
        created = report.created_dirs,
        copied = report.copied_files,
        skipped = report.skipped_files,
        "instance directories ready"
    );
    Ok(report)
}

// A copy interrupted half way must not leave a file under the final name,
// otherwise the next run would skip it.
fn copy_atomic(src: &Path, dst: &Path) -> std::io::Result<()> {
    let mut tmp_name = dst
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp_name.push(COPY_TMP_SUFFIX);
    let tmp = dst.with_file_name(tmp_name);

    let res = fs::copy(src, &tmp).and_then(|_| fs::rename(&tmp, dst));
    if res.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    res
}
