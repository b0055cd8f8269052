//! Local parallel executor
//!
//! Scheduling keeps a count of unfinished prerequisites per action and a
//! queue of actions whose count reached zero. Ready actions are spawned
//! immediately and wait on a semaphore sized to the slot count; an action
//! with weight `w` holds `ceil(w)` permits. When a failure stops the build or
//! the build is canceled, nothing new starts but running processes finish.

use super::process::{compute_max_parallel_actions, run_action_process};
use super::{ActionExecutor, ActionOutcome, ActionResult, CancellationFlag, ExecutionSummary};
use crate::action_history::ActionHistory;
use crate::config::BuildConfiguration;
use crate::error::{BuildError, BuildResult};
use crate::linked_action::{ActionId, LinkedAction};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Executes actions as local processes with bounded parallelism
pub struct ParallelExecutor {
    max_parallel: usize,
    stop_on_errors: bool,
    cancel: CancellationFlag,
}

impl ParallelExecutor {
    /// Executor with an explicit slot count
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
            stop_on_errors: false,
            cancel: CancellationFlag::new(),
        }
    }

    /// Executor sized from the configuration
    pub fn from_config(config: &BuildConfiguration, memory_per_action_gb: f64) -> Self {
        Self::new(compute_max_parallel_actions(config, memory_per_action_gb))
            .with_stop_on_errors(config.stop_on_errors)
    }

    /// Stop dispatching after the first failure
    pub fn with_stop_on_errors(mut self, stop_on_errors: bool) -> Self {
        self.stop_on_errors = stop_on_errors;
        self
    }

    /// Share a cancellation flag
    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Number of slots
    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    fn permits_for(&self, weight: f32) -> u32 {
        let permits = (weight.ceil() as usize).clamp(1, self.max_parallel);
        u32::try_from(permits).unwrap_or(u32::MAX)
    }
}

struct Completed {
    id: ActionId,
    outcome: ActionOutcome,
    output: String,
    duration: std::time::Duration,
}

fn skip_dependents(
    failed: ActionId,
    dependents: &HashMap<ActionId, Vec<ActionId>>,
    results: &mut HashMap<ActionId, ActionResult>,
    actions: &[LinkedAction],
) {
    let mut stack = vec![failed];
    while let Some(id) = stack.pop() {
        for &dependent in dependents.get(&id).into_iter().flatten() {
            if results.contains_key(&dependent) {
                continue;
            }
            debug!("Skipping {}", actions[dependent].description());
            let _ = results.insert(
                dependent,
                ActionResult {
                    id: dependent,
                    description: actions[dependent].description(),
                    outcome: ActionOutcome::Skipped,
                    output: String::new(),
                    duration: std::time::Duration::ZERO,
                },
            );
            stack.push(dependent);
        }
    }
}

#[async_trait]
impl ActionExecutor for ParallelExecutor {
    fn name(&self) -> &str {
        "Parallel"
    }

    async fn execute(
        &self,
        actions: &[LinkedAction],
        ids: &[ActionId],
        history: &ActionHistory,
    ) -> BuildResult<ExecutionSummary> {
        let started = Instant::now();
        let members: HashSet<ActionId> = ids.iter().copied().collect();
        let total = members.len();
        if total == 0 {
            return Ok(ExecutionSummary::default());
        }
        info!(
            "Building {} action(s) with {} process(es)",
            total, self.max_parallel
        );
        let remote_capable = members
            .iter()
            .filter(|&&id| actions[id].can_execute_remotely())
            .count();
        if remote_capable > 0 {
            debug!(
                "{} of {} action(s) could execute remotely; running them locally",
                remote_capable, total
            );
        }

        let mut remaining: HashMap<ActionId, usize> = HashMap::new();
        let mut dependents: HashMap<ActionId, Vec<ActionId>> = HashMap::new();
        for &id in &members {
            let prerequisites: Vec<ActionId> = actions[id]
                .prerequisite_actions
                .iter()
                .copied()
                .filter(|p| members.contains(p))
                .collect();
            let _ = remaining.insert(id, prerequisites.len());
            for prerequisite in prerequisites {
                dependents.entry(prerequisite).or_default().push(id);
            }
        }
        let mut initial: Vec<ActionId> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        initial.sort_unstable();
        let mut ready: VecDeque<ActionId> = initial.into();

        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let halted = Arc::new(AtomicBool::new(false));
        let mut running: JoinSet<Completed> = JoinSet::new();
        let mut results: HashMap<ActionId, ActionResult> = HashMap::new();
        let mut dispatched = 0usize;
        let mut order: Vec<ActionId> = Vec::with_capacity(total);

        loop {
            while let Some(id) = ready.pop_front() {
                if results.contains_key(&id) {
                    continue;
                }
                let action = Arc::clone(actions[id].action());
                let permits = self.permits_for(action.weight());
                let semaphore = Arc::clone(&semaphore);
                let halted = Arc::clone(&halted);
                let cancel = self.cancel.clone();
                let stop_on_errors = self.stop_on_errors;
                dispatched += 1;
                let position = dispatched;

                let _ = running.spawn(async move {
                    let skipped = |outcome| Completed {
                        id,
                        outcome,
                        output: String::new(),
                        duration: std::time::Duration::ZERO,
                    };
                    let Ok(_permit) = semaphore.acquire_many_owned(permits).await else {
                        return skipped(ActionOutcome::Canceled);
                    };
                    if cancel.is_canceled() {
                        return skipped(ActionOutcome::Canceled);
                    }
                    if halted.load(Ordering::SeqCst) {
                        return skipped(ActionOutcome::Skipped);
                    }
                    if action.should_output_status_description() {
                        info!("[{}/{}] {}", position, total, action.description());
                    }
                    let run = run_action_process(&action).await;
                    // Raise the flag while still holding the permit so no
                    // queued action slips through
                    if stop_on_errors && run.outcome != ActionOutcome::Succeeded {
                        halted.store(true, Ordering::SeqCst);
                    }
                    Completed {
                        id,
                        outcome: run.outcome,
                        output: run.output,
                        duration: run.duration,
                    }
                });
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let completed = joined
                .map_err(|e| BuildError::msg(format!("Action task failed: {e}")))?;
            let action = &actions[completed.id];
            order.push(completed.id);

            match completed.outcome {
                ActionOutcome::Succeeded => {
                    if !completed.output.trim().is_empty() {
                        info!("{}", completed.output.trim_end());
                    }
                    let command_line = action.command_line();
                    for item in action.produced_items() {
                        item.reset_cached_info();
                        if !item.exists() {
                            warn!(
                                "{} did not produce {}",
                                action.description(),
                                item.location().display()
                            );
                        }
                        if action.use_action_history() {
                            history.record(item, &command_line);
                        }
                    }
                    for &dependent in dependents.get(&completed.id).into_iter().flatten() {
                        if let Some(count) = remaining.get_mut(&dependent) {
                            *count -= 1;
                            if *count == 0 {
                                ready.push_back(dependent);
                            }
                        }
                    }
                }
                ActionOutcome::Failed { exit_code } => {
                    error!(
                        "{} failed (exit code {}):\n{}",
                        action.description(),
                        exit_code.map_or_else(|| "none".to_string(), |code| code.to_string()),
                        completed.output.trim_end()
                    );
                    for item in action.produced_items() {
                        item.reset_cached_info();
                    }
                }
                ActionOutcome::Skipped | ActionOutcome::Canceled => {}
            }

            let _ = results.insert(
                completed.id,
                ActionResult {
                    id: completed.id,
                    description: action.description(),
                    outcome: completed.outcome,
                    output: completed.output,
                    duration: completed.duration,
                },
            );
            if completed.outcome != ActionOutcome::Succeeded {
                skip_dependents(completed.id, &dependents, &mut results, actions);
            }
        }

        // Anything never dispatched was blocked by a failure or a cancellation
        let mut leftover: Vec<ActionId> = members
            .iter()
            .copied()
            .filter(|id| !results.contains_key(id))
            .collect();
        leftover.sort_unstable();
        let fallback = if self.cancel.is_canceled() {
            ActionOutcome::Canceled
        } else {
            ActionOutcome::Skipped
        };
        for id in leftover {
            let _ = results.insert(
                id,
                ActionResult {
                    id,
                    description: actions[id].description(),
                    outcome: fallback,
                    output: String::new(),
                    duration: std::time::Duration::ZERO,
                },
            );
        }

        let mut by_completion: Vec<ActionResult> = order
            .iter()
            .filter_map(|id| results.remove(id))
            .collect();
        let mut rest: Vec<ActionResult> = results.into_values().collect();
        rest.sort_by_key(|result| result.id);
        by_completion.extend(rest);

        let summary = ExecutionSummary {
            results: by_completion,
            total_duration: started.elapsed(),
        };
        info!("{}", summary.format());
        Ok(summary)
    }
}
