//! Persisted per-file caches
//!
//! Both caches store one entry per file, stamped with the file's length and
//! modification time when the entry was computed. A stamp mismatch means the
//! entry is stale and gets recomputed; nothing here is ever fatal.

pub mod dependency_cache;
pub mod metadata_cache;

pub use dependency_cache::{CppDependencyCache, DependencyInfo};
pub use metadata_cache::{SourceFileMetadata, SourceFileMetadataCache};

use crate::error::BuildResult;
use crate::file_item::FileItem;
use crate::persist::{load_versioned, save_versioned};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::UNIX_EPOCH;
use tracing::debug;

/// Length and modification time of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStamp {
    length: u64,
    modified_secs: u64,
    modified_nanos: u32,
}

impl FileStamp {
    /// Current stamp of an existing file
    pub fn of(item: &FileItem) -> Option<Self> {
        if !item.exists() {
            return None;
        }
        let modified = item.last_write_time()?.duration_since(UNIX_EPOCH).ok()?;
        Some(Self {
            length: item.length(),
            modified_secs: modified.as_secs(),
            modified_nanos: modified.subsec_nanos(),
        })
    }
}

/// One base directory's cache file
pub struct CacheLayer<V> {
    base_dir: PathBuf,
    location: Option<PathBuf>,
    version: u32,
    entries: DashMap<PathBuf, (FileStamp, V)>,
    modified: AtomicBool,
}

impl<V> CacheLayer<V>
where
    V: Clone + Serialize + DeserializeOwned,
{
    /// Load a layer, starting empty if the file is missing or unusable
    pub fn load(base_dir: impl Into<PathBuf>, location: impl Into<PathBuf>, version: u32) -> Self {
        let location = location.into();
        let entries: BTreeMap<PathBuf, (FileStamp, V)> =
            load_versioned(&location, version).unwrap_or_default();
        debug!(
            "Loaded cache {} ({} entries)",
            location.display(),
            entries.len()
        );
        Self {
            base_dir: base_dir.into(),
            location: Some(location),
            version,
            entries: entries.into_iter().collect(),
            modified: AtomicBool::new(false),
        }
    }

    /// A layer that is never persisted
    pub fn in_memory(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            location: None,
            version: 0,
            entries: DashMap::new(),
            modified: AtomicBool::new(false),
        }
    }

    fn save(&self) -> BuildResult<()> {
        let Some(location) = &self.location else {
            return Ok(());
        };
        if !self.modified.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let snapshot: BTreeMap<PathBuf, (FileStamp, V)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        debug!(
            "Saving cache {} ({} entries)",
            location.display(),
            snapshot.len()
        );
        save_versioned(location, self.version, &snapshot)
    }
}

/// Ordered set of layers sharing one value type
pub struct CacheHierarchy<V> {
    layers: Vec<CacheLayer<V>>,
}

impl<V> CacheHierarchy<V>
where
    V: Clone + Serialize + DeserializeOwned,
{
    /// Build a hierarchy; an empty layer list gets one in-memory layer
    pub fn new(layers: Vec<CacheLayer<V>>) -> Self {
        let layers = if layers.is_empty() {
            vec![CacheLayer::in_memory("/")]
        } else {
            layers
        };
        Self { layers }
    }

    /// Layers for `(base_dir, cache file)` pairs
    pub fn load(bases: impl IntoIterator<Item = (PathBuf, PathBuf)>, version: u32) -> Self {
        Self::new(
            bases
                .into_iter()
                .map(|(base, location)| CacheLayer::load(base, location, version))
                .collect(),
        )
    }

    fn layer_for(&self, path: &Path) -> &CacheLayer<V> {
        self.layers
            .iter()
            .filter(|layer| path.starts_with(&layer.base_dir))
            .max_by_key(|layer| layer.base_dir.components().count())
            .or_else(|| self.layers.last())
            .unwrap_or(&self.layers[0])
    }

    /// Cached value for `item`, recomputing it when the file changed
    ///
    /// `compute` returning `None` means the file could not be processed; the
    /// stale entry is dropped and nothing is cached.
    pub fn get_or_compute(
        &self,
        item: &FileItem,
        compute: impl FnOnce(&Path) -> Option<V>,
    ) -> Option<V> {
        let stamp = FileStamp::of(item)?;
        let layer = self.layer_for(item.location());
        if let Some(entry) = layer.entries.get(item.location()) {
            if entry.value().0 == stamp {
                return Some(entry.value().1.clone());
            }
            debug!("Cache entry for {} is stale", item.location().display());
        }

        match compute(item.location()) {
            Some(value) => {
                let _ = layer
                    .entries
                    .insert(item.location().to_path_buf(), (stamp, value.clone()));
                layer.modified.store(true, Ordering::Release);
                Some(value)
            }
            None => {
                if layer.entries.remove(item.location()).is_some() {
                    layer.modified.store(true, Ordering::Release);
                }
                None
            }
        }
    }

    /// Number of cached entries across all layers
    pub fn len(&self) -> usize {
        self.layers.iter().map(|layer| layer.entries.len()).sum()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist every modified layer
    pub fn save_all(&self) -> BuildResult<()> {
        for layer in &self.layers {
            layer.save()?;
        }
        Ok(())
    }
}
