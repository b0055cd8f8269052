//! Build configuration
//!
//! Settings are layered: defaults, then the engine's
//! `Saved/Bauleiter/BuildConfiguration.json`, then the project's, then an
//! explicit file. Each layer only overrides the fields it names. Command-line
//! flags are applied by the caller after loading.

use crate::error::{BuildError, BuildResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Relative location of the configuration file under an engine or project root
pub const CONFIG_FILE: &str = "Saved/Bauleiter/BuildConfiguration.json";

/// Effective build settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct BuildConfiguration {
    /// Maximum concurrent actions (0 = derive from the processor count)
    pub max_parallel_actions: usize,

    /// Multiplier applied to the logical processor count
    pub processor_count_multiplier: f64,

    /// Memory each action may need; throttles parallelism when non-zero
    pub memory_per_action_gb: f64,

    /// Do not propagate outdatedness through import libraries
    pub ignore_outdated_import_libraries: bool,

    /// Stop dispatching new actions after the first failure
    pub stop_on_errors: bool,

    /// Treat command line changes as an outdated trigger
    pub use_action_history: bool,

    /// Longest allowed produced path (0 = unlimited)
    pub max_path_length: usize,

    /// Fail instead of warning when a path exceeds `max_path_length`
    pub path_length_is_error: bool,

    /// Load and save cached target makefiles
    pub use_makefiles: bool,

    /// Fail if any outdated action writes under the engine directory
    pub no_engine_changes: bool,

    /// Log per-action outdated reasons
    pub print_debug_info: bool,
}

impl Default for BuildConfiguration {
    fn default() -> Self {
        Self {
            max_parallel_actions: 0,
            processor_count_multiplier: 1.0,
            memory_per_action_gb: 0.0,
            ignore_outdated_import_libraries: true,
            stop_on_errors: false,
            use_action_history: true,
            max_path_length: 0,
            path_length_is_error: false,
            use_makefiles: true,
            no_engine_changes: false,
            print_debug_info: false,
        }
    }
}

/// A partial configuration read from one file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ConfigurationOverlay {
    /// See [`BuildConfiguration::max_parallel_actions`]
    pub max_parallel_actions: Option<usize>,
    /// See [`BuildConfiguration::processor_count_multiplier`]
    pub processor_count_multiplier: Option<f64>,
    /// See [`BuildConfiguration::memory_per_action_gb`]
    pub memory_per_action_gb: Option<f64>,
    /// See [`BuildConfiguration::ignore_outdated_import_libraries`]
    pub ignore_outdated_import_libraries: Option<bool>,
    /// See [`BuildConfiguration::stop_on_errors`]
    pub stop_on_errors: Option<bool>,
    /// See [`BuildConfiguration::use_action_history`]
    pub use_action_history: Option<bool>,
    /// See [`BuildConfiguration::max_path_length`]
    pub max_path_length: Option<usize>,
    /// See [`BuildConfiguration::path_length_is_error`]
    pub path_length_is_error: Option<bool>,
    /// See [`BuildConfiguration::use_makefiles`]
    pub use_makefiles: Option<bool>,
    /// See [`BuildConfiguration::no_engine_changes`]
    pub no_engine_changes: Option<bool>,
    /// See [`BuildConfiguration::print_debug_info`]
    pub print_debug_info: Option<bool>,
}

impl ConfigurationOverlay {
    /// Read an overlay from a JSON file
    pub fn from_file(path: &Path) -> BuildResult<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            BuildError::msg(format!("Invalid configuration {}: {}", path.display(), e))
        })
    }
}

impl BuildConfiguration {
    /// Apply every field the overlay sets
    pub fn apply(&mut self, overlay: &ConfigurationOverlay) {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = overlay.$field {
                    self.$field = value;
                })*
            };
        }
        take!(
            max_parallel_actions,
            processor_count_multiplier,
            memory_per_action_gb,
            ignore_outdated_import_libraries,
            stop_on_errors,
            use_action_history,
            max_path_length,
            path_length_is_error,
            use_makefiles,
            no_engine_changes,
            print_debug_info,
        );
    }

    /// Candidate configuration files in precedence order (lowest first)
    pub fn search_paths(
        engine_dir: &Path,
        project_dir: Option<&Path>,
        explicit: Option<&Path>,
    ) -> Vec<PathBuf> {
        let mut paths = vec![engine_dir.join(CONFIG_FILE)];
        if let Some(project_dir) = project_dir {
            paths.push(project_dir.join(CONFIG_FILE));
        }
        if let Some(explicit) = explicit {
            paths.push(explicit.to_path_buf());
        }
        paths
    }

    /// Load the layered configuration
    ///
    /// Missing engine and project files are skipped; a missing explicit file
    /// is an error.
    pub fn load(
        engine_dir: &Path,
        project_dir: Option<&Path>,
        explicit: Option<&Path>,
    ) -> BuildResult<Self> {
        let mut config = Self::default();
        for path in Self::search_paths(engine_dir, project_dir, explicit) {
            let is_explicit = explicit == Some(path.as_path());
            if !is_explicit && !path.exists() {
                continue;
            }
            debug!("Reading configuration from {}", path.display());
            config.apply(&ConfigurationOverlay::from_file(&path)?);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = BuildConfiguration::default();
        assert_eq!(config.max_parallel_actions, 0);
        assert!(config.use_action_history);
        assert!(!config.no_engine_changes);
    }

    #[test]
    fn test_project_overrides_engine() {
        let engine = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        let write = |root: &Path, json: &str| {
            let path = root.join(CONFIG_FILE);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, json).unwrap();
        };
        write(
            engine.path(),
            r#"{ "MaxParallelActions": 4, "StopOnErrors": true }"#,
        );
        write(project.path(), r#"{ "MaxParallelActions": 12 }"#);

        let config = BuildConfiguration::load(engine.path(), Some(project.path()), None).unwrap();
        assert_eq!(config.max_parallel_actions, 12);
        assert!(config.stop_on_errors);
        assert!(config.use_makefiles);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let engine = TempDir::new().unwrap();
        let missing = engine.path().join("nope.json");
        assert!(BuildConfiguration::load(engine.path(), None, Some(&missing)).is_err());
    }
}
