//! Persisted record of the command line that last produced each file
//!
//! The history is split into layers, one per base directory (engine,
//! project). Each produced file belongs to the layer with the longest base
//! directory containing it; files outside every base go to the last layer.

use crate::error::BuildResult;
use crate::file_item::FileItem;
use crate::persist::{load_versioned, save_versioned};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

const HISTORY_VERSION: u32 = 1;

/// File name of a persisted history layer
pub const HISTORY_FILE: &str = "ActionHistory.bin";

/// One base directory's slice of the history
pub struct ActionHistoryLayer {
    base_dir: PathBuf,
    location: Option<PathBuf>,
    entries: DashMap<PathBuf, String>,
    modified: AtomicBool,
}

impl ActionHistoryLayer {
    /// Load a layer from `location`, starting empty if it is missing or corrupt
    pub fn load(base_dir: impl Into<PathBuf>, location: impl Into<PathBuf>) -> Self {
        let location = location.into();
        let entries: BTreeMap<PathBuf, String> =
            load_versioned(&location, HISTORY_VERSION).unwrap_or_default();
        debug!(
            "Mounted action history {} ({} entries)",
            location.display(),
            entries.len()
        );
        Self {
            base_dir: base_dir.into(),
            location: Some(location),
            entries: entries.into_iter().collect(),
            modified: AtomicBool::new(false),
        }
    }

    /// A layer that is never written to disk
    pub fn in_memory(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            location: None,
            entries: DashMap::new(),
            modified: AtomicBool::new(false),
        }
    }

    /// Base directory owned by this layer
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Persist the layer if it changed since loading
    pub fn save(&self) -> BuildResult<()> {
        let Some(location) = &self.location else {
            return Ok(());
        };
        // Cleared up front so records made during the write mark it again
        if !self.modified.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let snapshot: BTreeMap<PathBuf, String> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        debug!(
            "Saving action history {} ({} entries)",
            location.display(),
            snapshot.len()
        );
        let saved = save_versioned(location, HISTORY_VERSION, &snapshot);
        if saved.is_err() {
            self.modified.store(true, Ordering::Release);
        }
        saved
    }
}

/// Hierarchical produced-file to command-line store
pub struct ActionHistory {
    layers: Vec<ActionHistoryLayer>,
}

impl ActionHistory {
    /// Mount the given layers; order matters only for the fallback (last)
    pub fn mount(layers: Vec<ActionHistoryLayer>) -> Self {
        let layers = if layers.is_empty() {
            vec![ActionHistoryLayer::in_memory("/")]
        } else {
            layers
        };
        Self { layers }
    }

    /// A single unpersisted layer, for tools and tests
    pub fn in_memory() -> Self {
        Self::mount(Vec::new())
    }

    /// Standard location of a layer under an intermediate directory
    pub fn layer_location(intermediate_dir: &Path) -> PathBuf {
        intermediate_dir.join(HISTORY_FILE)
    }

    fn layer_for(&self, path: &Path) -> &ActionHistoryLayer {
        self.layers
            .iter()
            .filter(|layer| path.starts_with(&layer.base_dir))
            .max_by_key(|layer| layer.base_dir.components().count())
            .or_else(|| self.layers.last())
            .unwrap_or(&self.layers[0])
    }

    /// Command line that last produced `item`
    pub fn get(&self, item: &FileItem) -> Option<String> {
        self.layer_for(item.location())
            .entries
            .get(item.location())
            .map(|entry| entry.value().clone())
    }

    /// Whether `command_line` differs from the recorded one
    ///
    /// An item without a recorded command line counts as changed.
    pub fn has_changed(&self, item: &FileItem, command_line: &str) -> bool {
        match self.layer_for(item.location()).entries.get(item.location()) {
            Some(previous) => previous.value() != command_line,
            None => true,
        }
    }

    /// Record the command line that just produced `item`
    pub fn record(&self, item: &FileItem, command_line: &str) {
        let layer = self.layer_for(item.location());
        let previous = layer
            .entries
            .insert(item.location().to_path_buf(), command_line.to_string());
        if previous.as_deref() != Some(command_line) {
            layer.modified.store(true, Ordering::Release);
        }
    }

    /// Drop the entry for `item`
    pub fn forget(&self, item: &FileItem) {
        let layer = self.layer_for(item.location());
        if layer.entries.remove(item.location()).is_some() {
            layer.modified.store(true, Ordering::Release);
        }
    }

    /// Total number of entries across layers
    pub fn len(&self) -> usize {
        self.layers.iter().map(|layer| layer.entries.len()).sum()
    }

    /// Whether no layer holds any entry
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist every modified layer
    pub fn save(&self) -> BuildResult<()> {
        for layer in &self.layers {
            layer.save()?;
        }
        info!("Action history saved");
        Ok(())
    }
}

impl std::fmt::Debug for ActionHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.layers.iter().map(|layer| layer.base_dir.display()))
            .finish()
    }
}
