//! Bauleiter - incremental C++ target builds
//!
//! Drives the convenient-build action graph:
//! 1. Target makefile loading or creation
//! 2. Multi-target merging and linking
//! 3. Outdated action detection
//! 4. Parallel execution and post-build metadata
//!
//! The process exit code is the build's compilation result.

mod commands;

use clap::Parser;
use commands::{Cli, Commands};
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "bauleiter=debug,convenient_build=debug"
    } else {
        "bauleiter=info,convenient_build=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.command {
        Commands::Build(args) => commands::build::execute(args).await,
        Commands::Execute(args) => commands::execute::execute(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e.compilation_result();
            error!("{}", e);
            error!("Result: {}", code);
            ExitCode::from(u8::try_from(code.exit_code()).unwrap_or(u8::MAX))
        }
    }
}
