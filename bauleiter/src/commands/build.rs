//! `bauleiter build`

use super::BuildArgs;
use convenient_build::{
    BuildConfiguration, BuildMode, BuildOptions, BuildResult, BuildSession, CancellationFlag,
    EmptyWorkingSet, FileListWorkingSet, HotReloadMode, ManifestTargetBuilder, TargetDescriptor,
    WorkingSet,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Split `--project` into the project directory and descriptor file
fn project_location(project: Option<&Path>) -> (Option<PathBuf>, Option<PathBuf>) {
    match project {
        Some(path) if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("uproject")) => (
            path.parent().map(Path::to_path_buf),
            Some(path.to_path_buf()),
        ),
        Some(path) => (Some(path.to_path_buf()), None),
        None => (None, None),
    }
}

/// Apply command line flags over the loaded configuration
fn apply_overrides(config: &mut BuildConfiguration, args: &BuildArgs) {
    if let Some(jobs) = args.jobs {
        config.max_parallel_actions = jobs;
    }
    if args.stop_on_errors {
        config.stop_on_errors = true;
    }
    if args.no_engine_changes {
        config.no_engine_changes = true;
    }
    if args.no_makefile {
        config.use_makefiles = false;
    }
}

/// Parse target tokens and apply the per-target flags
fn descriptors(args: &BuildArgs, project_file: Option<&Path>) -> BuildResult<Vec<TargetDescriptor>> {
    let mut descriptors = TargetDescriptor::parse_command_line(&args.tokens)?;
    for descriptor in &mut descriptors {
        descriptor.only_modules.extend(args.modules.iter().cloned());
        descriptor.single_files.extend(args.single_files.iter().cloned());
        if args.hot_reload {
            descriptor.hot_reload = HotReloadMode::FromIde;
        } else if args.live_coding {
            descriptor.hot_reload = HotReloadMode::LiveCoding;
        }
        if descriptor.project_file.is_none() {
            descriptor.project_file = project_file.map(Path::to_path_buf);
        }
    }
    Ok(descriptors)
}

pub async fn execute(args: BuildArgs) -> BuildResult<()> {
    let (project_dir, project_file) = project_location(args.project.as_deref());
    let mut config = BuildConfiguration::load(
        &args.engine_dir,
        project_dir.as_deref(),
        args.config.as_deref(),
    )?;
    apply_overrides(&mut config, &args);
    debug!("Configuration: {:?}", config);

    let descriptors = descriptors(&args, project_file.as_deref())?;
    for descriptor in &descriptors {
        info!("Target: {}", descriptor);
    }

    let session = BuildSession::new(&args.engine_dir, project_dir.as_deref(), config);
    let working_set: Arc<dyn WorkingSet> = match &args.working_set {
        Some(path) => Arc::new(FileListWorkingSet::from_file(path)?),
        None => Arc::new(EmptyWorkingSet),
    };
    let cancel = CancellationFlag::new();
    cancel.cancel_on_ctrl_c();

    let options = BuildOptions {
        export_json: args.export_json.clone(),
        skip_execution: args.skip_execution,
        use_makefiles: !args.no_makefile,
        working_set,
        cancel,
    };
    let builder = ManifestTargetBuilder;
    let outcome = BuildMode::new(&session, &builder)
        .build(&descriptors, &options)
        .await?;

    info!(
        "{} action(s) in graph, {} required, {} outdated",
        outcome.total_actions, outcome.required_actions, outcome.outdated_actions
    );
    if let Some(summary) = &outcome.summary {
        info!("Execution: {}", summary.format());
    }
    if let Some(exported) = &outcome.exported {
        info!("Exported actions to {}", exported.display());
    }
    for receipt in &outcome.receipts {
        debug!("Receipt: {}", receipt.display());
    }
    Ok(())
}
