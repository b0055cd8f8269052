//! Incremental action graph build engine
//!
//! This crate turns per-target build plans into a linked graph of actions,
//! works out which actions are outdated and runs them in dependency order.
//!
//! # Features
//!
//! - Interned file items with cached stat information
//! - Action linking with conflict and cycle detection
//! - Outdated detection from timestamps, command line history and dependency lists
//! - Hierarchical dependency caches for `.d`, MSVC and P1689 dependency files
//! - Parallel execution bounded by processor count and memory
//! - Cached target makefiles, multi-target merging, C++ module interface
//!   resolution and hot reload patching
//!
//! # Example
//!
//! ```no_run
//! use convenient_build::{
//!     BuildConfiguration, BuildMode, BuildOptions, BuildSession, ManifestTargetBuilder,
//!     TargetDescriptor,
//! };
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Path::new("/opt/engine");
//!     let config = BuildConfiguration::load(engine, None, None)?;
//!     let session = BuildSession::new(engine, None, config);
//!
//!     let args: Vec<String> = ["Game", "Linux", "Development"].map(String::from).into();
//!     let targets = TargetDescriptor::parse_command_line(&args)?;
//!
//!     let builder = ManifestTargetBuilder;
//!     let outcome = BuildMode::new(&session, &builder)
//!         .build(&targets, &BuildOptions::default())
//!         .await?;
//!     println!("{} action(s) were outdated", outcome.outdated_actions);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod action;
pub mod action_graph;
pub mod action_history;
pub mod build_mode;
pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod file_item;
pub mod linked_action;
pub mod lock;
pub mod makefile;
pub mod persist;
pub mod session;
pub mod target;
pub mod target_manifest;
pub mod working_set;

pub use action::{Action, ActionBuilder, ActionType, SerializedAction};
pub use action_history::ActionHistory;
pub use build_mode::{BuildMode, BuildOptions, BuildOutcome, HotReloadMode};
pub use cache::{CppDependencyCache, SourceFileMetadataCache};
pub use config::BuildConfiguration;
pub use error::{BuildError, BuildResult, CompilationResult};
pub use executor::{
    ActionExecutor, ActionOutcome, CancellationFlag, ExecutionSummary, ParallelExecutor,
};
pub use file_item::{FileItem, FileItemRegistry};
pub use linked_action::{ActionId, LinkedAction};
pub use lock::BuildLock;
pub use makefile::TargetMakefile;
pub use session::BuildSession;
pub use target::{Configuration, Platform, TargetBuilder, TargetDescriptor};
pub use target_manifest::ManifestTargetBuilder;
pub use working_set::{EmptyWorkingSet, FileListWorkingSet, WorkingSet};
