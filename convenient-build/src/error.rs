//! Build errors and the process-level compilation result codes

use std::fmt;
use std::path::PathBuf;

/// Result codes reported to calling scripts as the process exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum CompilationResult {
    /// Everything built (or was already up to date)
    Succeeded = 0,

    /// A header changed in a way that needs a full rebuild of its dependents
    FailedDueToHeaderChange = 1,

    /// An action failed or the graph could not be built
    OtherCompilationError = 2,

    /// The requested platform/configuration is not supported
    Unsupported = 3,

    /// Unclassified failure
    Unknown = 4,

    /// Building would have modified files under the engine directory
    FailedDueToEngineChange = 5,

    /// The build was canceled (Ctrl-C)
    Canceled = 6,

    /// Two actions claimed the same produced file
    ConflictingActions = 7,
}

impl CompilationResult {
    /// Exit code for this result
    pub fn exit_code(self) -> i32 {
        self as i32
    }

    /// Whether this result represents success
    pub fn succeeded(self) -> bool {
        self == CompilationResult::Succeeded
    }
}

impl fmt::Display for CompilationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Succeeded => "Succeeded",
            Self::FailedDueToHeaderChange => "FailedDueToHeaderChange",
            Self::OtherCompilationError => "OtherCompilationError",
            Self::Unsupported => "Unsupported",
            Self::Unknown => "Unknown",
            Self::FailedDueToEngineChange => "FailedDueToEngineChange",
            Self::Canceled => "Canceled",
            Self::ConflictingActions => "ConflictingActions",
        };
        write!(f, "{name}")
    }
}

/// One produced file claimed by more than one action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerConflict {
    /// The contested file
    pub produced_item: PathBuf,

    /// Descriptions of every action claiming it
    pub actions: Vec<String>,
}

impl fmt::Display for ProducerConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} is produced by {}",
            self.produced_item.display(),
            self.actions.join(", ")
        )
    }
}

/// Result type for build operations
pub type BuildResult<T> = Result<T, BuildError>;

/// Errors raised by the action graph, caches, executor and build mode
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Generic build failure with a formatted message
    #[error("{0}")]
    Message(String),

    /// Multiple actions produce the same file
    #[error("Conflicting actions in graph:\n  {}", format_conflicts(.0))]
    ConflictingProducers(Vec<ProducerConflict>),

    /// The action graph contains a cycle
    #[error("Cyclic dependency between actions: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    /// A path exceeds the configured maximum length
    #[error("Path exceeds maximum length of {max} characters: {}", .path.display())]
    PathTooLong {
        /// Offending path
        path: PathBuf,
        /// Configured limit
        max: usize,
    },

    /// A C++ module import could not be resolved to an interface
    #[error("Unable to find interface for module '{module}' imported by {importer}")]
    ModuleNotFound {
        /// Imported module name
        module: String,
        /// Description of the importing action
        importer: String,
    },

    /// The build would modify files under a read-only engine directory
    #[error("Engine modules are out of date and cannot be compiled while engine changes are forbidden ({} files, e.g. {})", .0.len(), first_path(.0))]
    EngineChangesForbidden(Vec<PathBuf>),

    /// One or more actions failed during execution
    #[error("{failed} action(s) failed, {skipped} skipped")]
    ActionsFailed {
        /// Number of failed actions
        failed: usize,
        /// Number of actions skipped because a prerequisite failed
        skipped: usize,
    },

    /// The build was canceled before completion
    #[error("Build canceled")]
    Canceled,

    /// A target could not be constructed
    #[error("Unable to build target {target}: {reason}")]
    TargetFailed {
        /// Target description
        target: String,
        /// Underlying cause
        reason: String,
    },

    /// A build lock could not be acquired
    #[error("Failed to acquire build lock {}: {reason}", .path.display())]
    Lock {
        /// Lock file
        path: PathBuf,
        /// Cause
        reason: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary serialization error
    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),
}

impl BuildError {
    /// Convenience constructor for [`BuildError::Message`]
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// Map this error to the result code reported to calling scripts
    pub fn compilation_result(&self) -> CompilationResult {
        match self {
            Self::ConflictingProducers(_) => CompilationResult::ConflictingActions,
            Self::EngineChangesForbidden(_) => CompilationResult::FailedDueToEngineChange,
            Self::Canceled => CompilationResult::Canceled,
            Self::CyclicDependency(_)
            | Self::PathTooLong { .. }
            | Self::ModuleNotFound { .. }
            | Self::ActionsFailed { .. }
            | Self::TargetFailed { .. } => CompilationResult::OtherCompilationError,
            Self::Message(_)
            | Self::Lock { .. }
            | Self::Io(_)
            | Self::Json(_)
            | Self::Bincode(_) => CompilationResult::Unknown,
        }
    }
}

fn format_conflicts(conflicts: &[ProducerConflict]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n  ")
}

fn first_path(paths: &[PathBuf]) -> String {
    paths
        .first()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_stable() {
        assert_eq!(CompilationResult::Succeeded.exit_code(), 0);
        assert_eq!(CompilationResult::OtherCompilationError.exit_code(), 2);
        assert_eq!(CompilationResult::FailedDueToEngineChange.exit_code(), 5);
    }

    #[test]
    fn test_error_classification() {
        let conflict = BuildError::ConflictingProducers(vec![ProducerConflict {
            produced_item: PathBuf::from("/tmp/a.o"),
            actions: vec!["Compile a.cpp".into(), "Compile b.cpp".into()],
        }]);
        assert_eq!(
            conflict.compilation_result(),
            CompilationResult::ConflictingActions
        );
        assert!(conflict.to_string().contains("/tmp/a.o"));

        let failed = BuildError::ActionsFailed { failed: 1, skipped: 2 };
        assert_eq!(
            failed.compilation_result(),
            CompilationResult::OtherCompilationError
        );
        assert_eq!(failed.to_string(), "1 action(s) failed, 2 skipped");
    }
}
