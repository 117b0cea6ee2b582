use std::{fs, path::Path};

use crate::error::CleanupError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub files_removed: usize,
    pub dirs_removed: usize,
}

/// Removes everything below `artifact_root`, keeping the root itself.
///
/// A missing root is not an error. Running agents are not touched; callers
/// that want "stop and clean" must stop the supervisor first.
pub fn cleanup(artifact_root: &Path) -> Result<CleanupReport, CleanupError> {
    let mut report = CleanupReport::default();
    match fs::symlink_metadata(artifact_root) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(CleanupError::Read {
                path: artifact_root.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "artifact root is not a directory",
                ),
            });
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(root = %artifact_root.display(), "nothing to clean up");
            return Ok(report);
        }
        Err(source) => {
            return Err(CleanupError::Read {
                path: artifact_root.to_path_buf(),
                source,
            });
        }
    }

    empty_dir(artifact_root, &mut report)?;
    tracing::info!(
        root = %artifact_root.display(),
        files = report.files_removed,
        dirs = report.dirs_removed,
        "cleanup complete"
    );
    Ok(report)
}

fn empty_dir(dir: &Path, report: &mut CleanupReport) -> Result<(), CleanupError> {
    let read_err = |source| CleanupError::Read {
        path: dir.to_path_buf(),
        source,
    };

    for entry in fs::read_dir(dir).map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        let path = entry.path();
        // file_type() does not follow symlinks: a link to a directory is
        // removed as a file, never descended into.
        let ty = entry.file_type().map_err(read_err)?;
        if ty.is_dir() {
            empty_dir(&path, report)?;
            fs::remove_dir(&path).map_err(|source| CleanupError::Remove {
                path: path.clone(),
                source,
            })?;
            report.dirs_removed += 1;
        } else if ty.is_symlink() {
            // Directory symlinks on Windows need remove_dir.
            fs::remove_file(&path)
                .or_else(|_| fs::remove_dir(&path))
                .map_err(|source| CleanupError::Remove {
                    path: path.clone(),
                    source,
                })?;
            report.files_removed += 1;
        } else {
            remove_file(&path)?;
            report.files_removed += 1;
        }
    }
    Ok(())
}

fn remove_file(path: &Path) -> Result<(), CleanupError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        // Windows refuses to delete read-only files.
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            let mut perms = fs::symlink_metadata(path)
                .map_err(|source| CleanupError::Remove {
                    path: path.to_path_buf(),
                    source,
                })?
                .permissions();
            if !perms.readonly() {
                return Err(CleanupError::Remove {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
            perms.set_readonly(false);
            fs::set_permissions(path, perms)
                .and_then(|_| fs::remove_file(path))
                .map_err(|source| CleanupError::Remove {
                    path: path.to_path_buf(),
                    source,
                })
        }
        Err(source) => Err(CleanupError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instances::ensure_instances;
    use crate::test_support::temp_dir_for;

    #[test]
    fn missing_root_is_a_noop() {
        let root = temp_dir_for("cleanup-missing");
        assert_eq!(cleanup(&root).unwrap(), CleanupReport::default());
        assert!(!root.exists());
    }

    #[test]
    fn removes_instances_and_keeps_root() {
        let root = temp_dir_for("cleanup-instances");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("meshagent"), b"bin").unwrap();
        fs::write(root.join("meshagent.msh"), b"policy").unwrap();
        ensure_instances(&root, 3).unwrap();
        fs::create_dir_all(root.join("0").join("nested")).unwrap();
        fs::write(root.join("0").join("nested").join("db"), b"x").unwrap();

        let report = cleanup(&root).unwrap();
        assert_eq!(report.dirs_removed, 4);
        assert_eq!(report.files_removed, 2 + 3 * 2 + 1);

        assert!(root.is_dir());
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);

        // Second pass finds nothing.
        assert_eq!(cleanup(&root).unwrap(), CleanupReport::default());

        let _ = fs::remove_dir_all(&root);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directories_are_not_followed() {
        let base = temp_dir_for("cleanup-symlink");
        let root = base.join("agents");
        let outside = base.join("outside");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("keep.txt"), b"keep").unwrap();
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();

        let report = cleanup(&root).unwrap();
        assert_eq!(report.files_removed, 1);
        assert!(outside.join("keep.txt").exists());

        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn file_as_root_is_an_error() {
        let base = temp_dir_for("cleanup-file-root");
        fs::create_dir_all(&base).unwrap();
        let root = base.join("agents");
        fs::write(&root, b"oops").unwrap();

        assert!(matches!(cleanup(&root), Err(CleanupError::Read { .. })));

        let _ = fs::remove_dir_all(&base);
    }
}
