//! `bauleiter execute`: run an exported action graph as-is

use super::ExecuteArgs;
use convenient_build::action_graph::{create_directories_for_produced_items, import_json};
use convenient_build::{
    ActionExecutor, ActionHistory, ActionId, BuildConfiguration, BuildResult, CancellationFlag,
    ExecutionSummary, FileItemRegistry, LinkedAction, ParallelExecutor,
};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Give every action the exported environment under its own overrides
fn apply_environment(actions: &mut [LinkedAction], environment: &BTreeMap<String, String>) {
    if environment.is_empty() {
        return;
    }
    for action in actions.iter_mut() {
        let mut builder = action.action().to_builder();
        for (key, value) in environment {
            if !action.environment().contains_key(key) {
                builder = builder.env(key.clone(), value.clone());
            }
        }
        action.replace_inner(builder.build());
    }
}

/// Import `args.actions` and run every action in it
pub async fn run_exported(args: &ExecuteArgs, cancel: CancellationFlag) -> BuildResult<ExecutionSummary> {
    let registry = FileItemRegistry::new();
    let mut graph = import_json(&args.actions, &registry)?;
    apply_environment(&mut graph.actions, &graph.environment);

    let mut config = BuildConfiguration::default();
    if let Some(jobs) = args.jobs {
        config.max_parallel_actions = jobs;
    }
    config.stop_on_errors = args.stop_on_errors;

    let ids: Vec<ActionId> = (0..graph.actions.len()).collect();
    create_directories_for_produced_items(&graph.actions, &ids)?;

    let executor = ParallelExecutor::from_config(&config, 0.0).with_cancellation(cancel);
    debug!("Executing with {} slot(s)", executor.max_parallel());
    let history = ActionHistory::in_memory();
    executor.execute(&graph.actions, &ids, &history).await
}

pub async fn execute(args: ExecuteArgs) -> BuildResult<()> {
    let cancel = CancellationFlag::new();
    cancel.cancel_on_ctrl_c();
    let summary = run_exported(&args, cancel).await?;
    info!("Execution: {}", summary.format());
    let _ = summary.into_result()?;
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use convenient_build::action_graph::export_json;
    use convenient_build::{Action, ActionType, BuildError};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn shell(registry: &FileItemRegistry, dir: &std::path::Path, script: &str, output: &str) -> LinkedAction {
        let action = Action::builder(ActionType::Compile)
            .command("/bin/sh")
            .args(["-c", script])
            .working_directory(dir)
            .produces(registry.get_item_by_path(dir.join(output)))
            .build();
        LinkedAction::new(action, None)
    }

    fn write_graph(dir: &std::path::Path, actions: &[LinkedAction], environment: BTreeMap<String, String>) -> PathBuf {
        let path = dir.join("actions.json");
        let ids: Vec<ActionId> = (0..actions.len()).collect();
        export_json(&path, actions, &ids, &environment).unwrap();
        path
    }

    #[tokio::test]
    async fn test_exported_graph_runs_with_its_environment() {
        let tmp = TempDir::new().unwrap();
        let registry = FileItemRegistry::new();
        let actions = vec![shell(
            &registry,
            tmp.path(),
            "printf '%s' \"$GREETING\" > out/hello.txt",
            "out/hello.txt",
        )];
        let environment = BTreeMap::from([("GREETING".to_string(), "hallo".to_string())]);
        let path = write_graph(tmp.path(), &actions, environment);

        let args = ExecuteArgs {
            actions: path,
            jobs: Some(2),
            stop_on_errors: false,
        };
        let summary = run_exported(&args, CancellationFlag::new()).await.unwrap();
        assert!(summary.is_success());
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("out/hello.txt")).unwrap(),
            "hallo"
        );
    }

    #[tokio::test]
    async fn test_failing_action_fails_execute() {
        let tmp = TempDir::new().unwrap();
        let registry = FileItemRegistry::new();
        let actions = vec![shell(&registry, tmp.path(), "exit 3", "never.o")];
        let path = write_graph(tmp.path(), &actions, BTreeMap::new());

        let error = execute(ExecuteArgs {
            actions: path,
            jobs: None,
            stop_on_errors: true,
        })
        .await
        .unwrap_err();
        assert!(matches!(error, BuildError::ActionsFailed { failed: 1, .. }));
    }
}
