//! On-disk persistence helpers shared by every cache
//!
//! Binary caches are a bincode-encoded `u32` format version followed by the
//! payload. Loading never fails the build: a missing, truncated, or
//! version-mismatched file is reported as `None` and logged at debug level.

use crate::error::BuildResult;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::Path;
use tracing::debug;

/// Write data to a file atomically with fsync for durability
///
/// 1. Write data to a temporary file next to the destination
/// 2. fsync the temp file
/// 3. Rename it over the destination
/// 4. fsync the parent directory
pub fn atomic_write(path: &Path, data: &[u8]) -> BuildResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(format!(".{}.tmp", std::process::id()));
    let temp_path = std::path::PathBuf::from(temp_name);

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o644);
    }
    let mut file = options.open(&temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e.into());
    }

    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        // Not every filesystem supports syncing a directory
        let _ = dir.sync_all();
    }

    Ok(())
}

/// Serialize `value` behind a format version and write it atomically
pub fn save_versioned<T: Serialize>(path: &Path, version: u32, value: &T) -> BuildResult<()> {
    let mut data = bincode::serialize(&version)?;
    data.extend(bincode::serialize(value)?);
    atomic_write(path, &data)
}

/// Load a value written by [`save_versioned`]
///
/// Returns `None` when the file is missing, unreadable, or written by a
/// different format version.
pub fn load_versioned<T: DeserializeOwned>(path: &Path, version: u32) -> Option<T> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            debug!("Not loading {}: {}", path.display(), e);
            return None;
        }
    };
    let mut reader = BufReader::new(file);

    match bincode::deserialize_from::<_, u32>(&mut reader) {
        Ok(found) if found == version => {}
        Ok(found) => {
            debug!(
                "Discarding {}: format version {} (expected {})",
                path.display(),
                found,
                version
            );
            return None;
        }
        Err(e) => {
            debug!("Discarding {}: {}", path.display(), e);
            return None;
        }
    }

    match bincode::deserialize_from(&mut reader) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!("Discarding corrupt {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_replaces_content() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/dir/file.bin");
        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");

        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_versioned_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cache.bin");
        let mut value = BTreeMap::new();
        value.insert("a.o".to_string(), "clang -c a.cpp".to_string());

        save_versioned(&path, 3, &value).unwrap();
        let loaded: Option<BTreeMap<String, String>> = load_versioned(&path, 3);
        assert_eq!(loaded, Some(value));
    }

    #[test]
    fn test_version_mismatch_is_discarded() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cache.bin");
        save_versioned(&path, 1, &vec![1u32, 2, 3]).unwrap();
        let loaded: Option<Vec<u32>> = load_versioned(&path, 2);
        assert!(loaded.is_none());
    }

    #[test]
    fn test_garbage_is_discarded() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cache.bin");
        fs::write(&path, [7u8, 0, 0, 0, 0xff, 0xff]).unwrap();
        let loaded: Option<Vec<String>> = load_versioned(&path, 7);
        assert!(loaded.is_none());
        assert!(load_versioned::<Vec<String>>(&tmp.path().join("missing"), 7).is_none());
    }
}
