//! Cached, serializable build plan for one target
//!
//! A makefile is only reused when nothing it was derived from changed. That
//! means the same tool version and no rewritten configuration file. It also
//! means the same set of source files (tracked through directory
//! timestamps), unchanged reflection markup and the same working set
//! membership. A configuration file that is newer but has the recorded
//! content hash does not count as rewritten.

use crate::action::{Action, SerializedAction};
use crate::cache::SourceFileMetadataCache;
use crate::error::BuildResult;
use crate::file_item::{ContentHash, FileItem, FileItemRegistry};
use crate::persist::{load_versioned, save_versioned};
use crate::target::TargetDescriptor;
use crate::working_set::WorkingSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info};

const MAKEFILE_VERSION: u32 = 5;

/// File name of a persisted makefile
pub const MAKEFILE_NAME: &str = "Makefile.bin";

/// Build plan for one target
#[derive(Debug, Clone)]
pub struct TargetMakefile {
    /// When the makefile was generated
    pub created_at: SystemTime,

    /// Version of the tool that generated it
    pub tool_version: String,

    /// Every action the target needs
    pub actions: Vec<Arc<Action>>,

    /// Output items per module, used for partial builds and hot reload
    pub module_to_output_items: BTreeMap<String, Vec<Arc<FileItem>>>,

    /// Final outputs of the target
    pub output_items: Vec<Arc<FileItem>>,

    /// Scripts run before the makefile is used
    pub pre_build_scripts: Vec<PathBuf>,

    /// Scripts run after a successful build
    pub post_build_scripts: Vec<PathBuf>,

    /// Environment variables at creation time
    pub environment: BTreeMap<String, String>,

    /// Messages to repeat every time the makefile is used
    pub diagnostics: Vec<String>,

    /// Source files and whether each carried reflection markup
    pub source_files: BTreeMap<PathBuf, bool>,

    /// Source directories and their modification times
    pub source_directories: BTreeMap<PathBuf, Option<SystemTime>>,

    /// Candidate files that were in the working set
    pub working_set_files: BTreeSet<PathBuf>,

    /// Files whose working set membership affects the build plan
    pub candidate_working_set_files: BTreeSet<PathBuf>,

    /// Configuration files the plan was derived from, with their content hash
    pub config_dependencies: BTreeMap<PathBuf, Option<ContentHash>>,

    /// Memory each action may use (0 = unknown)
    pub memory_per_action_gb: f64,

    /// Modules that are rebuilt under hot reload
    pub hot_reload_module_names: BTreeSet<String>,

    /// Target receipt written after a successful build
    pub receipt_path: Option<PathBuf>,
}

#[derive(Serialize, Deserialize)]
struct MakefileData {
    created_at: SystemTime,
    tool_version: String,
    actions: Vec<SerializedAction>,
    module_to_output_items: BTreeMap<String, Vec<PathBuf>>,
    output_items: Vec<PathBuf>,
    pre_build_scripts: Vec<PathBuf>,
    post_build_scripts: Vec<PathBuf>,
    environment: BTreeMap<String, String>,
    diagnostics: Vec<String>,
    source_files: BTreeMap<PathBuf, bool>,
    source_directories: BTreeMap<PathBuf, Option<SystemTime>>,
    working_set_files: BTreeSet<PathBuf>,
    candidate_working_set_files: BTreeSet<PathBuf>,
    config_dependencies: BTreeMap<PathBuf, Option<ContentHash>>,
    memory_per_action_gb: f64,
    hot_reload_module_names: BTreeSet<String>,
    receipt_path: Option<PathBuf>,
}

fn paths(items: &[Arc<FileItem>]) -> Vec<PathBuf> {
    items
        .iter()
        .map(|item| item.location().to_path_buf())
        .collect()
}

impl TargetMakefile {
    /// Empty makefile stamped with the current time
    pub fn new(tool_version: impl Into<String>) -> Self {
        Self {
            created_at: SystemTime::now(),
            tool_version: tool_version.into(),
            actions: Vec::new(),
            module_to_output_items: BTreeMap::new(),
            output_items: Vec::new(),
            pre_build_scripts: Vec::new(),
            post_build_scripts: Vec::new(),
            environment: BTreeMap::new(),
            diagnostics: Vec::new(),
            source_files: BTreeMap::new(),
            source_directories: BTreeMap::new(),
            working_set_files: BTreeSet::new(),
            candidate_working_set_files: BTreeSet::new(),
            config_dependencies: BTreeMap::new(),
            memory_per_action_gb: 0.0,
            hot_reload_module_names: BTreeSet::new(),
            receipt_path: None,
        }
    }

    /// Where the makefile for `descriptor` lives under `intermediate_dir`
    pub fn location(descriptor: &TargetDescriptor, intermediate_dir: &Path) -> PathBuf {
        intermediate_dir
            .join("Build")
            .join(descriptor.platform.as_str())
            .join(&descriptor.name)
            .join(descriptor.configuration.as_str())
            .join(descriptor.architecture())
            .join(MAKEFILE_NAME)
    }

    /// Record a source file and whether it declares reflected types
    pub fn add_source_file(&mut self, item: &FileItem, has_markup: bool) {
        let _ = self
            .source_files
            .insert(item.location().to_path_buf(), has_markup);
    }

    /// Record a configuration file the plan depends on
    pub fn add_config_dependency(&mut self, item: &FileItem, hash: Option<ContentHash>) {
        let _ = self
            .config_dependencies
            .insert(item.location().to_path_buf(), hash);
    }

    /// Record a source directory's current timestamp
    pub fn add_source_directory(&mut self, directory: &FileItem) {
        let _ = self.source_directories.insert(
            directory.location().to_path_buf(),
            directory.last_write_time(),
        );
    }

    /// Write the makefile atomically
    pub fn save(&self, path: &Path) -> BuildResult<()> {
        let data = MakefileData {
            created_at: self.created_at,
            tool_version: self.tool_version.clone(),
            actions: self.actions.iter().map(|a| a.to_serialized()).collect(),
            module_to_output_items: self
                .module_to_output_items
                .iter()
                .map(|(module, items)| (module.clone(), paths(items)))
                .collect(),
            output_items: paths(&self.output_items),
            pre_build_scripts: self.pre_build_scripts.clone(),
            post_build_scripts: self.post_build_scripts.clone(),
            environment: self.environment.clone(),
            diagnostics: self.diagnostics.clone(),
            source_files: self.source_files.clone(),
            source_directories: self.source_directories.clone(),
            working_set_files: self.working_set_files.clone(),
            candidate_working_set_files: self.candidate_working_set_files.clone(),
            config_dependencies: self.config_dependencies.clone(),
            memory_per_action_gb: self.memory_per_action_gb,
            hot_reload_module_names: self.hot_reload_module_names.clone(),
            receipt_path: self.receipt_path.clone(),
        };
        save_versioned(path, MAKEFILE_VERSION, &data)?;
        debug!("Saved makefile {}", path.display());
        Ok(())
    }

    /// Load a makefile, or `None` with the reason logged
    ///
    /// Only checks that do not need the working set happen here: format,
    /// tool version, and configuration timestamps.
    pub fn load(path: &Path, registry: &FileItemRegistry, tool_version: &str) -> Option<Self> {
        let Some(data) = load_versioned::<MakefileData>(path, MAKEFILE_VERSION) else {
            info!("Creating makefile ({} is missing or unreadable)", path.display());
            return None;
        };
        if data.tool_version != tool_version {
            info!(
                "Invalidating makefile {} (tool version changed from {} to {})",
                path.display(),
                data.tool_version,
                tool_version
            );
            return None;
        }
        for (config, recorded_hash) in &data.config_dependencies {
            let item = registry.get_item_by_path(config);
            if item
                .last_write_time()
                .is_some_and(|modified| modified > data.created_at)
            {
                if let Some(recorded) = recorded_hash
                    && item.content_hash().is_ok_and(|current| current == *recorded)
                {
                    debug!("{} was touched but not changed", config.display());
                    continue;
                }
                info!(
                    "Invalidating makefile {} ({} was modified)",
                    path.display(),
                    config.display()
                );
                return None;
            }
        }

        let intern = |paths: &[PathBuf]| -> Vec<Arc<FileItem>> {
            paths.iter().map(|p| registry.get_item_by_path(p)).collect()
        };
        Some(Self {
            created_at: data.created_at,
            tool_version: data.tool_version,
            actions: data
                .actions
                .iter()
                .map(|action| Arc::new(action.intern(registry)))
                .collect(),
            module_to_output_items: data
                .module_to_output_items
                .iter()
                .map(|(module, items)| (module.clone(), intern(items)))
                .collect(),
            output_items: intern(&data.output_items),
            pre_build_scripts: data.pre_build_scripts,
            post_build_scripts: data.post_build_scripts,
            environment: data.environment,
            diagnostics: data.diagnostics,
            source_files: data.source_files,
            source_directories: data.source_directories,
            working_set_files: data.working_set_files,
            candidate_working_set_files: data.candidate_working_set_files,
            config_dependencies: data.config_dependencies,
            memory_per_action_gb: data.memory_per_action_gb,
            hot_reload_module_names: data.hot_reload_module_names,
            receipt_path: data.receipt_path,
        })
    }

    /// Check the makefile against the current source tree and working set
    ///
    /// Returns the reason the makefile must be regenerated, if any.
    pub fn is_valid_for_source_files(
        &self,
        registry: &FileItemRegistry,
        metadata_cache: &SourceFileMetadataCache,
        working_set: &dyn WorkingSet,
    ) -> Result<(), String> {
        for (directory, recorded) in &self.source_directories {
            let item = registry.get_item_by_path(directory);
            if !item.exists() {
                return Err(format!("{} was deleted", directory.display()));
            }
            if item.last_write_time() != *recorded {
                return Err(format!(
                    "files were added to or removed from {}",
                    directory.display()
                ));
            }
        }

        for (file, had_markup) in &self.source_files {
            let item = registry.get_item_by_path(file);
            if !item.exists() {
                return Err(format!("{} was deleted", file.display()));
            }
            if metadata_cache.contains_reflection_markup(&item) != *had_markup {
                return Err(format!(
                    "reflection markup in {} {}",
                    file.display(),
                    if *had_markup { "was removed" } else { "was added" }
                ));
            }
        }

        for candidate in &self.candidate_working_set_files {
            let item = registry.get_item_by_path(candidate);
            let was_member = self.working_set_files.contains(candidate);
            if working_set.contains(&item) != was_member {
                return Err(format!(
                    "{} {} the working set",
                    candidate.display(),
                    if was_member { "left" } else { "joined" }
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionType;
    use crate::target::{Configuration, Platform};
    use crate::working_set::{EmptyWorkingSet, FileListWorkingSet};
    use filetime::{FileTime, set_file_mtime};
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn sample(registry: &FileItemRegistry, root: &Path) -> TargetMakefile {
        let mut makefile = TargetMakefile::new("1.0");
        let object = registry.get_item_by_path(root.join("a.o"));
        makefile.actions.push(Arc::new(
            Action::builder(ActionType::Compile)
                .command("cc")
                .args(["-c", "a.cpp"])
                .prerequisite(registry.get_item_by_path(root.join("a.cpp")))
                .produces(Arc::clone(&object))
                .build(),
        ));
        makefile
            .module_to_output_items
            .insert("Core".to_string(), vec![Arc::clone(&object)]);
        makefile.output_items.push(object);
        makefile
    }

    #[test]
    fn test_round_trip_reproduces_actions() {
        let tmp = TempDir::new().unwrap();
        let registry = FileItemRegistry::new();
        let makefile = sample(&registry, tmp.path());
        let descriptor = TargetDescriptor::new("Game", Platform::Linux, Configuration::Development);
        let path = TargetMakefile::location(&descriptor, tmp.path());
        assert!(path.ends_with("Build/Linux/Game/Development/x64/Makefile.bin"));
        makefile.save(&path).unwrap();

        let loaded = TargetMakefile::load(&path, &registry, "1.0").unwrap();
        assert_eq!(loaded.actions.len(), 1);
        assert_eq!(loaded.actions[0].command_line(), makefile.actions[0].command_line());
        assert!(Arc::ptr_eq(&loaded.output_items[0], &makefile.output_items[0]));
        assert_eq!(loaded.module_to_output_items["Core"].len(), 1);
    }

    #[test]
    #[traced_test]
    fn test_tool_version_change_invalidates() {
        let tmp = TempDir::new().unwrap();
        let registry = FileItemRegistry::new();
        let path = tmp.path().join(MAKEFILE_NAME);
        sample(&registry, tmp.path()).save(&path).unwrap();
        assert!(TargetMakefile::load(&path, &registry, "2.0").is_none());
        assert!(logs_contain("tool version changed from 1.0 to 2.0"));
        assert!(TargetMakefile::load(&tmp.path().join("missing.bin"), &registry, "1.0").is_none());
        assert!(logs_contain("is missing or unreadable"));
    }

    #[test]
    fn test_newer_config_invalidates() {
        let tmp = TempDir::new().unwrap();
        let registry = FileItemRegistry::new();
        let config = tmp.path().join("BuildConfiguration.json");
        std::fs::write(&config, "{}").unwrap();

        let mut makefile = sample(&registry, tmp.path());
        makefile.created_at = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1000);
        let config_item = registry.get_item_by_path(&config);
        makefile.add_config_dependency(&config_item, config_item.content_hash().ok());
        let path = tmp.path().join(MAKEFILE_NAME);
        makefile.save(&path).unwrap();

        set_file_mtime(&config, FileTime::from_unix_time(500, 0)).unwrap();
        assert!(TargetMakefile::load(&path, &registry, "1.0").is_some());

        // Newer but identical content keeps the plan
        set_file_mtime(&config, FileTime::from_unix_time(2000, 0)).unwrap();
        registry.reset_all_cached_info();
        assert!(TargetMakefile::load(&path, &registry, "1.0").is_some());

        std::fs::write(&config, r#"{"MaxParallelActions": 2}"#).unwrap();
        set_file_mtime(&config, FileTime::from_unix_time(3000, 0)).unwrap();
        registry.reset_all_cached_info();
        assert!(TargetMakefile::load(&path, &registry, "1.0").is_none());
    }

    #[test]
    fn test_config_without_recorded_hash_invalidates_on_timestamp() {
        let tmp = TempDir::new().unwrap();
        let registry = FileItemRegistry::new();
        let config = tmp.path().join("BuildConfiguration.json");
        std::fs::write(&config, "{}").unwrap();

        let mut makefile = sample(&registry, tmp.path());
        makefile.created_at = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1000);
        makefile.add_config_dependency(&registry.get_item_by_path(&config), None);
        let path = tmp.path().join(MAKEFILE_NAME);
        makefile.save(&path).unwrap();

        set_file_mtime(&config, FileTime::from_unix_time(2000, 0)).unwrap();
        registry.reset_all_cached_info();
        assert!(TargetMakefile::load(&path, &registry, "1.0").is_none());
    }

    #[test]
    fn test_source_changes_invalidate() {
        let tmp = TempDir::new().unwrap();
        let source_dir = tmp.path().join("Source");
        std::fs::create_dir_all(&source_dir).unwrap();
        let header = source_dir.join("Actor.h");
        std::fs::write(&header, "struct FActor {};\n").unwrap();

        let registry = FileItemRegistry::new();
        let metadata = SourceFileMetadataCache::in_memory();
        let mut makefile = TargetMakefile::new("1.0");
        let header_item = registry.get_item_by_path(&header);
        makefile.add_source_file(&header_item, metadata.contains_reflection_markup(&header_item));
        makefile.add_source_directory(&registry.get_item_by_path(&source_dir));
        makefile.candidate_working_set_files.insert(header.clone());
        assert!(makefile.is_valid_for_source_files(&registry, &metadata, &EmptyWorkingSet).is_ok());

        // Working set membership changed
        let editing = FileListWorkingSet::new([&header]);
        let reason = makefile
            .is_valid_for_source_files(&registry, &metadata, &editing)
            .unwrap_err();
        assert!(reason.contains("joined the working set"));

        // Markup added
        std::fs::write(&header, "UCLASS()\nclass UActor {};\n").unwrap();
        set_file_mtime(&header, FileTime::from_unix_time(1_000_000, 0)).unwrap();
        registry.reset_all_cached_info();
        let reason = makefile
            .is_valid_for_source_files(&registry, &metadata, &EmptyWorkingSet)
            .unwrap_err();
        assert!(reason.contains("markup"), "{reason}");

        // New file in the directory
        std::fs::write(source_dir.join("New.cpp"), "").unwrap();
        set_file_mtime(&source_dir, FileTime::from_unix_time(2_000_000, 0)).unwrap();
        registry.reset_all_cached_info();
        let reason = makefile
            .is_valid_for_source_files(&registry, &metadata, &EmptyWorkingSet)
            .unwrap_err();
        assert!(reason.contains("added to or removed"));
    }
}
