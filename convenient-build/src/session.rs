//! State shared by every component during one build invocation
//!
//! A session owns the file item registry, both dependency caches and the
//! action history. Nothing here is global; two sessions in the same process
//! do not see each other's state.

use crate::action_graph::OutdatedContext;
use crate::action_history::{ActionHistory, ActionHistoryLayer};
use crate::cache::dependency_cache::DEPENDENCY_CACHE_FILE;
use crate::cache::metadata_cache::METADATA_CACHE_FILE;
use crate::cache::{CppDependencyCache, SourceFileMetadataCache};
use crate::config::BuildConfiguration;
use crate::error::BuildResult;
use crate::file_item::{FileItemRegistry, normalize_path};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Version stamped into makefiles; a different version discards them
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Subdirectory of `Intermediate` holding this tool's state
pub const INTERMEDIATE_SUBDIR: &str = "Intermediate/Bauleiter";

/// Everything one build invocation shares
pub struct BuildSession {
    engine_dir: PathBuf,
    project_dir: Option<PathBuf>,
    config: BuildConfiguration,
    registry: FileItemRegistry,
    dependency_cache: CppDependencyCache,
    metadata_cache: SourceFileMetadataCache,
    history: ActionHistory,
    environment: BTreeMap<String, String>,
}

impl BuildSession {
    /// Mount caches and history for the engine and optional project
    pub fn new(engine_dir: &Path, project_dir: Option<&Path>, config: BuildConfiguration) -> Self {
        let engine_dir = normalize_path(engine_dir);
        let project_dir = project_dir.map(normalize_path);

        // Engine first, project last: the last layer is the fallback
        let mut bases = vec![engine_dir.clone()];
        bases.extend(project_dir.clone());
        let layer_files = |file: &str| -> Vec<(PathBuf, PathBuf)> {
            bases
                .iter()
                .map(|base| (base.clone(), base.join(INTERMEDIATE_SUBDIR).join(file)))
                .collect()
        };

        let dependency_cache = CppDependencyCache::create_hierarchy(layer_files(DEPENDENCY_CACHE_FILE));
        let metadata_cache = SourceFileMetadataCache::create_hierarchy(layer_files(METADATA_CACHE_FILE));
        let history = if config.use_action_history {
            ActionHistory::mount(
                bases
                    .iter()
                    .map(|base| {
                        ActionHistoryLayer::load(
                            base.clone(),
                            ActionHistory::layer_location(&base.join(INTERMEDIATE_SUBDIR)),
                        )
                    })
                    .collect(),
            )
        } else {
            debug!("Action history disabled");
            ActionHistory::in_memory()
        };

        info!(
            "Build session for {}{}",
            engine_dir.display(),
            project_dir
                .as_ref()
                .map(|project| format!(" (project {})", project.display()))
                .unwrap_or_default()
        );

        Self {
            engine_dir,
            project_dir,
            config,
            registry: FileItemRegistry::new(),
            dependency_cache,
            metadata_cache,
            history,
            environment: std::env::vars().collect(),
        }
    }

    /// Session with nothing persisted, for tools and tests
    pub fn in_memory(engine_dir: &Path, config: BuildConfiguration) -> Self {
        Self {
            engine_dir: normalize_path(engine_dir),
            project_dir: None,
            config,
            registry: FileItemRegistry::new(),
            dependency_cache: CppDependencyCache::in_memory(),
            metadata_cache: SourceFileMetadataCache::in_memory(),
            history: ActionHistory::in_memory(),
            environment: std::env::vars().collect(),
        }
    }

    /// Engine root
    pub fn engine_dir(&self) -> &Path {
        &self.engine_dir
    }

    /// Project root, if building a project target
    pub fn project_dir(&self) -> Option<&Path> {
        self.project_dir.as_deref()
    }

    /// Root the build lock is scoped to
    pub fn root_dir(&self) -> &Path {
        self.project_dir.as_deref().unwrap_or(&self.engine_dir)
    }

    /// Intermediate directory for makefiles and per-target state
    pub fn intermediate_dir(&self) -> PathBuf {
        self.root_dir().join(INTERMEDIATE_SUBDIR)
    }

    /// Effective configuration
    pub fn config(&self) -> &BuildConfiguration {
        &self.config
    }

    /// Mutable configuration, for command line overrides
    pub fn config_mut(&mut self) -> &mut BuildConfiguration {
        &mut self.config
    }

    /// Interned file items
    pub fn registry(&self) -> &FileItemRegistry {
        &self.registry
    }

    /// Dependency-list cache
    pub fn dependency_cache(&self) -> &CppDependencyCache {
        &self.dependency_cache
    }

    /// Source metadata cache
    pub fn metadata_cache(&self) -> &SourceFileMetadataCache {
        &self.metadata_cache
    }

    /// Produced-file command line history
    pub fn history(&self) -> &ActionHistory {
        &self.history
    }

    /// Environment when the session was created
    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    /// Outdated-check context wired to this session's state
    pub fn outdated_context(&self) -> OutdatedContext<'_> {
        OutdatedContext {
            registry: &self.registry,
            history: &self.history,
            dependency_cache: &self.dependency_cache,
            use_action_history: self.config.use_action_history,
            ignore_outdated_import_libraries: self.config.ignore_outdated_import_libraries,
            print_debug_info: self.config.print_debug_info,
        }
    }

    /// Persist history and both caches
    pub fn save_caches(&self) -> BuildResult<()> {
        self.history.save()?;
        self.dependency_cache.save_all()?;
        self.metadata_cache.save_all()?;
        debug!("Saved session caches");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_sessions_are_independent() {
        let tmp = TempDir::new().unwrap();
        let a = BuildSession::in_memory(tmp.path(), BuildConfiguration::default());
        let b = BuildSession::in_memory(tmp.path(), BuildConfiguration::default());
        let path = tmp.path().join("x.o");
        let item_a = a.registry().get_item_by_path(&path);
        assert!(Arc::ptr_eq(&item_a, &a.registry().get_item_by_path(&path)));
        assert!(!Arc::ptr_eq(&item_a, &b.registry().get_item_by_path(&path)));
    }

    #[test]
    fn test_history_persists_under_project() {
        let engine = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        let produced = project.path().join("Binaries/Game.so");
        {
            let session = BuildSession::new(
                engine.path(),
                Some(project.path()),
                BuildConfiguration::default(),
            );
            assert_eq!(session.root_dir(), project.path());
            let item = session.registry().get_item_by_path(&produced);
            session.history().record(&item, "ld -o Game.so");
            session.save_caches().unwrap();
        }
        assert!(
            project
                .path()
                .join(INTERMEDIATE_SUBDIR)
                .join(crate::action_history::HISTORY_FILE)
                .exists()
        );

        let session = BuildSession::new(engine.path(), Some(project.path()), BuildConfiguration::default());
        let item = session.registry().get_item_by_path(&produced);
        assert!(!session.history().has_changed(&item, "ld -o Game.so"));
    }
}
