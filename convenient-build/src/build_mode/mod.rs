//! Building one or more targets
//!
//! One invocation runs these steps in order:
//!
//! 1. take the build lock for the root directory
//! 2. load or create every target's makefile and run its pre-build scripts
//! 3. wrap the actions per target and merge them across targets
//! 4. link the merged graph and validate path lengths
//! 5. run module dependency scans and patch module imports
//! 6. apply hot reload renames and re-link
//! 7. pick the actions needed for the requested outputs and find the outdated ones
//! 8. delete stale outputs, execute, then run post-build steps and write metadata
//!
//! Anything wrong with the merged graph aborts before a single action runs.
//! A target that cannot be constructed is dropped; the other targets still
//! build and the invocation reports the failure at the end.

pub mod hot_reload;
pub mod merge;
pub mod metadata;
pub mod module_interfaces;
pub mod scripts;

pub use hot_reload::HotReloadMode;
pub use merge::merge_actions;
pub use metadata::{TargetReceipt, write_metadata};
pub use module_interfaces::patch_module_interfaces;

use crate::action::ActionType;
use crate::action_graph::{
    OutdatedActionMap, check_path_lengths, create_directories_for_produced_items,
    delete_outdated_produced_items, export_json, gather_prerequisite_actions, get_outdated_actions,
    link,
};
use crate::error::{BuildError, BuildResult};
use crate::executor::{ActionExecutor, CancellationFlag, ExecutionSummary, ParallelExecutor};
use crate::file_item::FileItem;
use crate::linked_action::{ActionId, LinkedAction};
use crate::lock::BuildLock;
use crate::makefile::TargetMakefile;
use crate::session::{BuildSession, TOOL_VERSION};
use crate::target::{TargetBuilder, TargetDescriptor};
use crate::working_set::{EmptyWorkingSet, WorkingSet};
use hot_reload::{
    LiveCodingManifest, apply_hot_reload_suffix, hot_reload_modules, live_coding_manifest_path,
    live_coding_outputs, write_live_coding_manifest,
};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Per-invocation switches
#[derive(Clone)]
pub struct BuildOptions {
    /// Write the outdated actions to this JSON file
    pub export_json: Option<PathBuf>,

    /// Stop after the outdated set is known
    pub skip_execution: bool,

    /// Load and save cached makefiles (also gated by the configuration)
    pub use_makefiles: bool,

    /// Files the user is editing
    pub working_set: Arc<dyn WorkingSet>,

    /// Shared with the executor; set on Ctrl-C
    pub cancel: CancellationFlag,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            export_json: None,
            skip_execution: false,
            use_makefiles: true,
            working_set: Arc::new(EmptyWorkingSet),
            cancel: CancellationFlag::new(),
        }
    }
}

/// What an invocation did
#[derive(Debug, Default)]
pub struct BuildOutcome {
    /// Actions in the merged graph
    pub total_actions: usize,

    /// Actions needed for the requested outputs
    pub required_actions: usize,

    /// Required actions that were outdated
    pub outdated_actions: usize,

    /// Execution results, if anything ran
    pub summary: Option<ExecutionSummary>,

    /// Exported action graph
    pub exported: Option<PathBuf>,

    /// Target receipts written
    pub receipts: Vec<PathBuf>,
}

struct PreparedTarget {
    descriptor: TargetDescriptor,
    makefile: TargetMakefile,
}

/// Drives a build of several targets against one session
pub struct BuildMode<'a> {
    session: &'a BuildSession,
    builder: &'a dyn TargetBuilder,
    executor: Option<Arc<dyn ActionExecutor>>,
}

impl<'a> BuildMode<'a> {
    /// Build mode creating missing makefiles with `builder`
    pub fn new(session: &'a BuildSession, builder: &'a dyn TargetBuilder) -> Self {
        Self {
            session,
            builder,
            executor: None,
        }
    }

    /// Use `executor` instead of a [`ParallelExecutor`] sized from the configuration
    pub fn with_executor(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Build `descriptors`
    pub async fn build(
        &self,
        descriptors: &[TargetDescriptor],
        options: &BuildOptions,
    ) -> BuildResult<BuildOutcome> {
        if descriptors.is_empty() {
            return Err(BuildError::msg("No targets specified"));
        }
        if descriptors.len() > 1
            && let Some(hot) = descriptors.iter().find(|d| d.hot_reload.is_enabled())
        {
            return Err(BuildError::msg(format!(
                "Hot reload ({:?}) for {} cannot be combined with other targets",
                hot.hot_reload,
                hot.group_name()
            )));
        }
        let started = Instant::now();
        let _lock = BuildLock::acquire(self.session.root_dir(), "build")?;
        let config = self.session.config();

        let mut targets = Vec::new();
        let mut target_errors = Vec::new();
        for descriptor in descriptors {
            match self.prepare_target(descriptor, options).await {
                Ok(makefile) => targets.push(PreparedTarget {
                    descriptor: descriptor.clone(),
                    makefile,
                }),
                Err(e @ BuildError::TargetFailed { .. }) => {
                    error!("{}", e);
                    target_errors.push(e);
                }
                Err(e) => return Err(e),
            }
        }
        if targets.is_empty() {
            return Err(target_errors
                .into_iter()
                .next()
                .unwrap_or_else(|| BuildError::msg("No targets could be built")));
        }

        let per_target: Vec<Vec<LinkedAction>> = targets
            .iter()
            .map(|target| {
                target
                    .makefile
                    .actions
                    .iter()
                    .map(|action| LinkedAction::new(Arc::clone(action), Some(&target.descriptor)))
                    .collect()
            })
            .collect();
        let mut actions = if per_target.len() == 1 {
            per_target.into_iter().flatten().collect()
        } else {
            merge_actions(per_target)?
        };
        // Heterogeneous targets share one pool; the hungriest target sizes it
        let memory_per_action_gb = targets
            .iter()
            .map(|target| target.makefile.memory_per_action_gb)
            .fold(0.0, f64::max);

        link(&mut actions)?;
        check_path_lengths(&actions, config.max_path_length, config.path_length_is_error)?;

        let executor = self.executor(options, memory_per_action_gb);
        let scan_executor = (!options.skip_execution).then_some(executor.as_ref());
        let _ = patch_module_interfaces(&mut actions, self.session, scan_executor).await?;

        let renames = self.apply_hot_reload(&targets, &mut actions)?;
        let mut desired: Vec<Arc<FileItem>> = Vec::new();
        let mut live_coding: Vec<(PathBuf, LiveCodingManifest)> = Vec::new();
        for target in &targets {
            if target.descriptor.hot_reload == HotReloadMode::LiveCoding {
                let module_items = self.hot_reload_items(target);
                let (objects, manifest) =
                    live_coding_outputs(&actions, &module_items, self.session.environment());
                desired.extend(objects);
                let receipt = metadata::receipt_path(
                    &target.descriptor,
                    &target.makefile,
                    self.session.root_dir(),
                );
                live_coding.push((live_coding_manifest_path(&receipt), manifest));
            } else {
                desired.extend(
                    self.desired_outputs(target, &actions)?
                        .into_iter()
                        .map(|item| renames.get(&item).cloned().unwrap_or(item)),
                );
            }
        }

        let required = gather_prerequisite_actions(&actions, &desired);
        let dependency_lists: Vec<Arc<FileItem>> = required
            .iter()
            .filter_map(|&id| actions[id].dependency_list_file().cloned())
            .collect();
        self.session.dependency_cache().prefetch(&dependency_lists);

        let map = OutdatedActionMap::new();
        let outdated = get_outdated_actions(
            &actions,
            &required,
            &self.session.outdated_context(),
            &map,
        )?;
        info!(
            "{} of {} required action(s) are outdated ({} in graph)",
            outdated.len(),
            required.len(),
            actions.len()
        );

        if config.no_engine_changes {
            check_engine_changes(
                &actions,
                &outdated,
                self.session.engine_dir(),
                self.session.project_dir(),
            )?;
        }

        let mut outcome = BuildOutcome {
            total_actions: actions.len(),
            required_actions: required.len(),
            outdated_actions: outdated.len(),
            ..BuildOutcome::default()
        };
        if let Some(path) = &options.export_json {
            export_json(path, &actions, &outdated, self.session.environment())?;
            info!("Exported {} action(s) to {}", outdated.len(), path.display());
            outcome.exported = Some(path.clone());
        }
        if options.skip_execution {
            self.session.save_caches()?;
            return Ok(outcome);
        }

        if outdated.is_empty() {
            info!("Target is up to date");
        } else {
            outcome.summary = Some(self.execute(executor.as_ref(), &actions, &outdated).await?);
        }
        self.session.save_caches()?;

        for target in &targets {
            run_post_build(self.session, target).await?;
            if target.descriptor.hot_reload != HotReloadMode::LiveCoding {
                outcome.receipts.push(write_metadata(
                    &target.descriptor,
                    &target.makefile,
                    &renames,
                    self.session.root_dir(),
                )?);
            }
        }
        for (path, manifest) in &live_coding {
            write_live_coding_manifest(path, manifest)?;
        }

        info!("Total build time: {:.2}s", started.elapsed().as_secs_f64());
        match target_errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    fn executor(&self, options: &BuildOptions, memory_per_action_gb: f64) -> Arc<dyn ActionExecutor> {
        match &self.executor {
            Some(executor) => Arc::clone(executor),
            None => Arc::new(
                ParallelExecutor::from_config(self.session.config(), memory_per_action_gb)
                    .with_cancellation(options.cancel.clone()),
            ),
        }
    }

    /// Load a valid cached makefile or create one, then run pre-build scripts
    async fn prepare_target(
        &self,
        descriptor: &TargetDescriptor,
        options: &BuildOptions,
    ) -> BuildResult<TargetMakefile> {
        let session = self.session;
        let use_makefiles = options.use_makefiles && session.config().use_makefiles;
        let location = TargetMakefile::location(descriptor, &session.intermediate_dir());

        let cached = if use_makefiles {
            TargetMakefile::load(&location, session.registry(), TOOL_VERSION).filter(|makefile| {
                match makefile.is_valid_for_source_files(
                    session.registry(),
                    session.metadata_cache(),
                    options.working_set.as_ref(),
                ) {
                    Ok(()) => true,
                    Err(reason) => {
                        info!("Invalidating makefile for {} ({})", descriptor.group_name(), reason);
                        false
                    }
                }
            })
        } else {
            None
        };

        let makefile = match cached {
            Some(makefile) => {
                debug!("Using cached makefile {}", location.display());
                makefile
            }
            None => {
                info!("Creating makefile for {}", descriptor.group_name());
                let mut makefile = self
                    .builder
                    .build_makefile(descriptor, session)
                    .map_err(|e| match e {
                        BuildError::TargetFailed { .. } => e,
                        other => BuildError::TargetFailed {
                            target: descriptor.group_name(),
                            reason: other.to_string(),
                        },
                    })?;
                makefile.working_set_files = makefile
                    .candidate_working_set_files
                    .iter()
                    .filter(|path| {
                        options
                            .working_set
                            .contains(&session.registry().get_item_by_path(path))
                    })
                    .cloned()
                    .collect();
                if use_makefiles {
                    makefile.save(&location)?;
                }
                makefile
            }
        };

        for diagnostic in &makefile.diagnostics {
            warn!("{}", diagnostic);
        }
        scripts::run_build_scripts("pre-build", &makefile.pre_build_scripts, descriptor, session)
            .await?;
        Ok(makefile)
    }

    fn hot_reload_items(&self, target: &PreparedTarget) -> Vec<Arc<FileItem>> {
        hot_reload_modules(&target.makefile, self.session.engine_dir())
            .iter()
            .filter_map(|module| target.makefile.module_to_output_items.get(module))
            .flatten()
            .cloned()
            .collect()
    }

    /// Rename hot-reloaded binaries and re-link when anything changed
    fn apply_hot_reload(
        &self,
        targets: &[PreparedTarget],
        actions: &mut [LinkedAction],
    ) -> BuildResult<HashMap<Arc<FileItem>, Arc<FileItem>>> {
        let mut renames = HashMap::new();
        for target in targets.iter().filter(|t| t.descriptor.hot_reload.renames_outputs()) {
            let module_items = self.hot_reload_items(target);
            renames.extend(apply_hot_reload_suffix(
                actions,
                &module_items,
                self.session.registry(),
            )?);
        }
        if !renames.is_empty() {
            link(actions)?;
        }
        Ok(renames)
    }

    /// Items the target's build must produce
    fn desired_outputs(
        &self,
        target: &PreparedTarget,
        actions: &[LinkedAction],
    ) -> BuildResult<Vec<Arc<FileItem>>> {
        let descriptor = &target.descriptor;
        let makefile = &target.makefile;
        let failed = |reason: String| BuildError::TargetFailed {
            target: descriptor.group_name(),
            reason,
        };

        let mut desired = Vec::new();
        for module in &descriptor.only_modules {
            let items = makefile
                .module_to_output_items
                .get(module)
                .ok_or_else(|| failed(format!("module '{module}' is not part of the target")))?;
            desired.extend(items.iter().cloned());
        }
        for file in &descriptor.single_files {
            let source = self.session.registry().get_item_by_path(file);
            let before = desired.len();
            desired.extend(
                actions
                    .iter()
                    .filter(|action| {
                        action.action_type() == ActionType::Compile
                            && action.prerequisite_items().contains(&source)
                    })
                    .flat_map(|action| action.produced_items().iter().cloned()),
            );
            if desired.len() == before {
                return Err(failed(format!("no action compiles {}", source.location().display())));
            }
        }
        if descriptor.is_partial() {
            return Ok(desired);
        }

        if !makefile.output_items.is_empty() {
            return Ok(makefile.output_items.clone());
        }
        let group = descriptor.group_name();
        Ok(actions
            .iter()
            .filter(|action| action.group_names.contains(&group))
            .flat_map(|action| action.produced_items().iter().cloned())
            .collect())
    }

    async fn execute(
        &self,
        executor: &dyn ActionExecutor,
        actions: &[LinkedAction],
        outdated: &[ActionId],
    ) -> BuildResult<ExecutionSummary> {
        let history = self.session.history();
        delete_outdated_produced_items(actions, outdated, history)?;
        history.save()?;
        create_directories_for_produced_items(actions, outdated)?;

        info!("Building {} action(s) with {}", outdated.len(), executor.name());
        let executed = executor.execute(actions, outdated, history).await;
        // Whatever ran successfully is recorded even if the build failed
        self.session.save_caches()?;
        let summary = executed?;
        info!("{}", summary.format());
        summary.into_result()
    }
}

async fn run_post_build(session: &BuildSession, target: &PreparedTarget) -> BuildResult<()> {
    scripts::run_build_scripts(
        "post-build",
        &target.makefile.post_build_scripts,
        &target.descriptor,
        session,
    )
    .await
}

/// Fail if an outdated action would write under the engine directory
///
/// Outputs of a project nested inside the engine directory are allowed.
pub fn check_engine_changes(
    actions: &[LinkedAction],
    outdated: &[ActionId],
    engine_dir: &Path,
    project_dir: Option<&Path>,
) -> BuildResult<()> {
    let violations: BTreeSet<PathBuf> = outdated
        .iter()
        .flat_map(|&id| actions[id].produced_items())
        .filter(|item| item.is_under(engine_dir))
        .filter(|item| project_dir.is_none_or(|project| !item.is_under(project)))
        .map(|item| item.location().to_path_buf())
        .collect();
    if violations.is_empty() {
        return Ok(());
    }
    for path in violations.iter().take(10) {
        error!("Would modify engine file {}", path.display());
    }
    Err(BuildError::EngineChangesForbidden(violations.into_iter().collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::error::CompilationResult;
    use crate::file_item::FileItemRegistry;

    #[test]
    fn test_engine_changes_exclude_nested_project() {
        let registry = FileItemRegistry::new();
        let engine_object = Action::builder(ActionType::Compile)
            .command("cc")
            .produces(registry.get_item_by_path("/engine/Intermediate/Core.o"))
            .build();
        let project_object = Action::builder(ActionType::Compile)
            .command("cc")
            .produces(registry.get_item_by_path("/engine/Projects/Game/Intermediate/Game.o"))
            .build();
        let actions = vec![
            LinkedAction::new(engine_object, None),
            LinkedAction::new(project_object, None),
        ];
        let engine = Path::new("/engine");
        let project = Path::new("/engine/Projects/Game");

        assert!(check_engine_changes(&actions, &[1], engine, Some(project)).is_ok());
        let error = check_engine_changes(&actions, &[0, 1], engine, Some(project)).unwrap_err();
        assert_eq!(error.compilation_result(), CompilationResult::FailedDueToEngineChange);
        assert!(matches!(error, BuildError::EngineChangesForbidden(ref paths) if paths.len() == 1));
    }
}
