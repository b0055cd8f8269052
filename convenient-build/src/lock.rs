//! Cross-process build locks
//!
//! Two builds of the same root must not run at once. The lock is an
//! exclusive `flock` on a file in the temp directory whose name is derived
//! from the locked directory, so differently spelled roots that normalise to
//! the same path share a lock.

use crate::error::{BuildError, BuildResult};
use crate::file_item::normalize_path;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Held lock; released on drop
#[derive(Debug)]
pub struct BuildLock {
    path: PathBuf,
    _file: File,
}

impl BuildLock {
    /// Lock file path for `root` and lock `name`
    pub fn lock_path(root: &Path, name: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(
            normalize_path(root).to_string_lossy().as_bytes(),
        ));
        std::env::temp_dir().join(format!("bauleiter-{}-{}.lock", &digest[..16], name))
    }

    /// Block until the named lock for `root` is held
    pub fn acquire(root: &Path, name: &str) -> BuildResult<Self> {
        let path = Self::lock_path(root, name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| BuildError::Lock {
                path: path.clone(),
                reason: format!("unable to create lock file: {e}"),
            })?;

        lock_exclusive(&file).map_err(|reason| BuildError::Lock {
            path: path.clone(),
            reason,
        })?;
        debug!("Acquired {} lock for {}", name, root.display());
        Ok(Self { path, _file: file })
    }

    /// Lock file backing this lock
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
#[allow(deprecated)]
fn lock_exclusive(file: &File) -> Result<(), String> {
    use nix::fcntl::{FlockArg, flock};
    use std::os::unix::io::AsRawFd;

    // Blocks while another process holds the lock
    flock(file.as_raw_fd(), FlockArg::LockExclusive).map_err(|e| e.to_string())
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> Result<(), String> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_path_is_stable_per_root_and_name() {
        let tmp = TempDir::new().unwrap();
        let a = BuildLock::lock_path(tmp.path(), "build");
        let b = BuildLock::lock_path(&tmp.path().join("x/.."), "build");
        assert_eq!(a, b);
        assert_ne!(a, BuildLock::lock_path(tmp.path(), "metadata"));
    }

    #[test]
    fn test_distinct_locks_can_be_held_together() {
        let tmp = TempDir::new().unwrap();
        let build = BuildLock::acquire(tmp.path(), "build").unwrap();
        let metadata = BuildLock::acquire(tmp.path(), "metadata").unwrap();
        assert!(build.path().exists());
        assert_ne!(build.path(), metadata.path());
    }
}
