//! Interned file handles with cached metadata
//!
//! Every path that takes part in a build is represented by exactly one
//! [`FileItem`] per [`FileItemRegistry`]. Looking the same normalized path up
//! twice returns the same `Arc`, so identity comparisons are pointer
//! comparisons and cached stat information is shared across the whole graph.

use dashmap::DashMap;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::trace;

/// SHA-256 content fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hex::encode(hasher.finalize()))
    }

    /// Hash a file's content
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let content = std::fs::read(path)?;
        Ok(Self::from_bytes(&content))
    }

    /// Hex digest
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0[..self.0.len().min(8)])
    }
}

/// Snapshot of a file's stat information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileInfo {
    exists: bool,
    is_directory: bool,
    length: u64,
    last_write_time: Option<SystemTime>,
}

impl FileInfo {
    fn stat(path: &Path) -> Self {
        match std::fs::metadata(path) {
            Ok(metadata) => Self {
                exists: true,
                is_directory: metadata.is_dir(),
                length: metadata.len(),
                last_write_time: metadata.modified().ok(),
            },
            // Missing or unreadable files are a valid state, not an error
            Err(_) => Self {
                exists: false,
                is_directory: false,
                length: 0,
                last_write_time: None,
            },
        }
    }
}

/// A deduplicated handle to a file path with lazily cached metadata
pub struct FileItem {
    location: PathBuf,
    info: RwLock<Option<FileInfo>>,
    content_hash: RwLock<Option<ContentHash>>,
}

impl FileItem {
    fn new(location: PathBuf) -> Self {
        Self {
            location,
            info: RwLock::new(None),
            content_hash: RwLock::new(None),
        }
    }

    /// Absolute, normalized path of this item
    pub fn location(&self) -> &Path {
        &self.location
    }

    /// File name component
    pub fn name(&self) -> &str {
        self.location
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
    }

    /// Check the extension, case-insensitively and without the leading dot
    pub fn has_extension(&self, extension: &str) -> bool {
        self.location
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(extension.trim_start_matches('.')))
    }

    fn info(&self) -> FileInfo {
        if let Some(info) = *self.info.read() {
            return info;
        }
        let mut slot = self.info.write();
        *slot.get_or_insert_with(|| {
            trace!("stat {}", self.location.display());
            FileInfo::stat(&self.location)
        })
    }

    /// Whether the file exists on disk
    pub fn exists(&self) -> bool {
        self.info().exists
    }

    /// Whether the path is a directory
    pub fn is_directory(&self) -> bool {
        self.info().is_directory
    }

    /// Size in bytes (0 when missing)
    pub fn length(&self) -> u64 {
        self.info().length
    }

    /// Last modification time, if the file exists
    pub fn last_write_time(&self) -> Option<SystemTime> {
        self.info().last_write_time
    }

    /// Content digest, computed on first request and cached until reset
    pub fn content_hash(&self) -> io::Result<ContentHash> {
        if let Some(hash) = self.content_hash.read().clone() {
            return Ok(hash);
        }
        let hash = ContentHash::from_file(&self.location)?;
        *self.content_hash.write() = Some(hash.clone());
        Ok(hash)
    }

    /// Forget cached stat and digest so the next query hits the filesystem
    pub fn reset_cached_info(&self) {
        *self.info.write() = None;
        *self.content_hash.write() = None;
    }

    /// Check whether this item lives under `directory`
    pub fn is_under(&self, directory: &Path) -> bool {
        self.location.starts_with(directory)
    }
}

// Items are interned, so path equality and identity coincide.
impl PartialEq for FileItem {
    fn eq(&self, other: &Self) -> bool {
        self.location == other.location
    }
}

impl Eq for FileItem {}

impl Hash for FileItem {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.location.hash(state);
    }
}

impl PartialOrd for FileItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FileItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.location.cmp(&other.location)
    }
}

impl fmt::Debug for FileItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileItem({})", self.location.display())
    }
}

impl fmt::Display for FileItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.location.display())
    }
}

/// Normalize a path lexically and make it absolute against the current directory
pub fn normalize_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// Concurrent interning table for [`FileItem`]s
#[derive(Default)]
pub struct FileItemRegistry {
    items: DashMap<PathBuf, Arc<FileItem>>,
}

impl FileItemRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the unique item for `path`, creating it on first lookup
    pub fn get_item_by_path(&self, path: impl AsRef<Path>) -> Arc<FileItem> {
        let location = normalize_path(path.as_ref());
        if let Some(item) = self.items.get(&location) {
            return Arc::clone(item.value());
        }
        Arc::clone(
            self.items
                .entry(location.clone())
                .or_insert_with(|| Arc::new(FileItem::new(location)))
                .value(),
        )
    }

    /// Look up an item without creating it
    pub fn find(&self, path: impl AsRef<Path>) -> Option<Arc<FileItem>> {
        let location = normalize_path(path.as_ref());
        self.items.get(&location).map(|item| Arc::clone(item.value()))
    }

    /// Invalidate the cached metadata of every known item
    pub fn reset_all_cached_info(&self) {
        for item in self.items.iter() {
            item.value().reset_cached_info();
        }
    }

    /// Number of interned items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl fmt::Debug for FileItemRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileItemRegistry")
            .field("items", &self.items.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_same_path_same_instance() {
        let registry = FileItemRegistry::new();
        let a = registry.get_item_by_path("/tmp/project/Source/a.cpp");
        let b = registry.get_item_by_path("/tmp/project/Source/./sub/../a.cpp");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_lookups_intern_once() {
        let registry = Arc::new(FileItemRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.get_item_by_path("/tmp/shared/item.h"))
            })
            .collect();
        let items: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for item in &items[1..] {
            assert!(Arc::ptr_eq(&items[0], item));
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let tmp = TempDir::new().unwrap();
        let registry = FileItemRegistry::new();
        let item = registry.get_item_by_path(tmp.path().join("missing.obj"));
        assert!(!item.exists());
        assert_eq!(item.length(), 0);
        assert!(item.last_write_time().is_none());
    }

    #[test]
    fn test_reset_cached_info_restats() {
        let tmp = TempDir::new().unwrap();
        let registry = FileItemRegistry::new();
        let path = tmp.path().join("out.obj");
        let item = registry.get_item_by_path(&path);
        assert!(!item.exists());

        std::fs::write(&path, b"object").unwrap();
        // Still cached as missing
        assert!(!item.exists());

        item.reset_cached_info();
        assert!(item.exists());
        assert_eq!(item.length(), 6);
    }

    #[test]
    fn test_content_hash_is_cached_until_reset() {
        let tmp = TempDir::new().unwrap();
        let registry = FileItemRegistry::new();
        let path = tmp.path().join("a.h");
        std::fs::write(&path, b"#pragma once").unwrap();
        let item = registry.get_item_by_path(&path);

        let first = item.content_hash().unwrap();
        std::fs::write(&path, b"#pragma once\n// changed").unwrap();
        assert_eq!(item.content_hash().unwrap(), first);

        item.reset_cached_info();
        assert_ne!(item.content_hash().unwrap(), first);
    }

    #[test]
    fn test_extension_checks() {
        let registry = FileItemRegistry::new();
        let item = registry.get_item_by_path("/tmp/Binaries/Game.LIB");
        assert!(item.has_extension("lib"));
        assert!(item.has_extension(".lib"));
        assert!(!item.has_extension("dll"));
        assert_eq!(item.name(), "Game.LIB");
    }
}
