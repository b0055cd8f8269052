//! Bauleiter command-line interface
//!
//! - `build`: build one or more targets, reusing cached makefiles
//! - `execute`: run an action graph exported by `build --export-json`

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub mod build;
pub mod execute;

/// Bauleiter - incremental C++ target builds
#[derive(Parser)]
#[command(name = "bauleiter")]
#[command(about = "Incremental C++ target builds driven by an action graph")]
#[command(version)]
pub struct Cli {
    /// Log debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build targets
    ///
    /// Tokens are target names, platforms and configurations, e.g.
    /// `Game Linux Development`. Grouped forms such as
    /// `-Target="Game Linux Debug"` go after `--`.
    Build(BuildArgs),

    /// Execute an exported action graph
    Execute(ExecuteArgs),
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Target names, platforms and configurations
    pub tokens: Vec<String>,

    /// Engine root directory
    #[arg(long, default_value = ".")]
    pub engine_dir: PathBuf,

    /// Project directory or `.uproject` file
    #[arg(long)]
    pub project: Option<PathBuf>,

    /// Maximum number of concurrent actions
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Extra configuration file, applied over engine and project settings
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Patch module binaries under new names for a running editor
    #[arg(long, conflicts_with = "live_coding")]
    pub hot_reload: bool,

    /// Compile objects for live coding without linking
    #[arg(long)]
    pub live_coding: bool,

    /// Fail if any outdated action writes under the engine directory
    #[arg(long)]
    pub no_engine_changes: bool,

    /// Write the outdated actions to this JSON file
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Stop once the outdated actions are known
    #[arg(long)]
    pub skip_execution: bool,

    /// Only build the outputs of these modules
    #[arg(long = "module")]
    pub modules: Vec<String>,

    /// Only build actions consuming these source files
    #[arg(long = "single-file")]
    pub single_files: Vec<PathBuf>,

    /// Stop dispatching actions after the first failure
    #[arg(long)]
    pub stop_on_errors: bool,

    /// Ignore and do not write cached makefiles
    #[arg(long)]
    pub no_makefile: bool,

    /// File listing the sources being edited, one per line
    #[arg(long)]
    pub working_set: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ExecuteArgs {
    /// Exported action graph
    #[arg(long)]
    pub actions: PathBuf,

    /// Maximum number of concurrent actions
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Stop dispatching actions after the first failure
    #[arg(long)]
    pub stop_on_errors: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_arguments() {
        let cli = Cli::try_parse_from([
            "bauleiter",
            "build",
            "Game",
            "Linux",
            "Development",
            "--engine-dir",
            "/engine",
            "-j",
            "8",
            "--module",
            "Core",
            "--module",
            "Renderer",
            "--hot-reload",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        let Commands::Build(args) = cli.command else {
            panic!("expected build");
        };
        assert_eq!(args.tokens, ["Game", "Linux", "Development"]);
        assert_eq!(args.engine_dir, PathBuf::from("/engine"));
        assert_eq!(args.jobs, Some(8));
        assert_eq!(args.modules, ["Core", "Renderer"]);
        assert!(args.hot_reload);
        assert!(!args.live_coding);
    }

    #[test]
    fn test_hot_reload_conflicts_with_live_coding() {
        let result = Cli::try_parse_from([
            "bauleiter",
            "build",
            "Game",
            "--hot-reload",
            "--live-coding",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_grouped_targets_after_separator() {
        let cli = Cli::try_parse_from([
            "bauleiter",
            "build",
            "--",
            "-Target=Game Linux Debug",
        ])
        .unwrap();
        let Commands::Build(args) = cli.command else {
            panic!("expected build");
        };
        assert_eq!(args.tokens, ["-Target=Game Linux Debug"]);
    }

    #[test]
    fn test_execute_arguments() {
        let cli = Cli::try_parse_from(["bauleiter", "execute", "--actions", "graph.json"]).unwrap();
        let Commands::Execute(args) = cli.command else {
            panic!("expected execute");
        };
        assert_eq!(args.actions, PathBuf::from("graph.json"));
        assert_eq!(args.jobs, None);
    }
}
