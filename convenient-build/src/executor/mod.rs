//! Action execution
//!
//! An [`ActionExecutor`] runs a subset of a linked graph so that no action
//! starts before all of its prerequisite actions in the subset succeeded.

pub mod parallel;
pub mod process;

pub use parallel::ParallelExecutor;
pub use process::{compute_max_parallel_actions, physical_memory_bytes};

use crate::action_history::ActionHistory;
use crate::error::{BuildError, BuildResult};
use crate::linked_action::{ActionId, LinkedAction};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// How one action ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The process exited successfully
    Succeeded,
    /// The process failed or could not be started
    Failed {
        /// Exit code, if the process ran and exited normally
        exit_code: Option<i32>,
    },
    /// A prerequisite action failed or the build stopped on an error
    Skipped,
    /// The build was canceled before the action ran
    Canceled,
}

/// Result of one action
#[derive(Debug, Clone)]
pub struct ActionResult {
    /// Id within the executed slice
    pub id: ActionId,
    /// Action description
    pub description: String,
    /// Outcome
    pub outcome: ActionOutcome,
    /// Captured stdout and stderr
    pub output: String,
    /// Wall-clock time spent running
    pub duration: Duration,
}

/// Per-action outcomes of one execution
#[derive(Debug, Clone, Default)]
pub struct ExecutionSummary {
    /// One entry per requested action, in completion order
    pub results: Vec<ActionResult>,
    /// Total wall-clock time
    pub total_duration: Duration,
}

impl ExecutionSummary {
    fn count(&self, predicate: impl Fn(&ActionOutcome) -> bool) -> usize {
        self.results
            .iter()
            .filter(|result| predicate(&result.outcome))
            .count()
    }

    /// Number of successful actions
    pub fn succeeded(&self) -> usize {
        self.count(|outcome| *outcome == ActionOutcome::Succeeded)
    }

    /// Number of failed actions
    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, ActionOutcome::Failed { .. }))
    }

    /// Number of skipped actions
    pub fn skipped(&self) -> usize {
        self.count(|outcome| *outcome == ActionOutcome::Skipped)
    }

    /// Number of canceled actions
    pub fn canceled(&self) -> usize {
        self.count(|outcome| *outcome == ActionOutcome::Canceled)
    }

    /// Outcome of a given action
    pub fn outcome_of(&self, id: ActionId) -> Option<ActionOutcome> {
        self.results
            .iter()
            .find(|result| result.id == id)
            .map(|result| result.outcome)
    }

    /// Whether every action succeeded
    pub fn is_success(&self) -> bool {
        self.succeeded() == self.results.len()
    }

    /// Convert into the build result: failures win over cancellation
    pub fn into_result(self) -> BuildResult<ExecutionSummary> {
        if self.failed() > 0 {
            return Err(BuildError::ActionsFailed {
                failed: self.failed(),
                skipped: self.skipped(),
            });
        }
        if self.canceled() > 0 {
            return Err(BuildError::Canceled);
        }
        Ok(self)
    }

    /// One-line summary for logs
    pub fn format(&self) -> String {
        format!(
            "{} succeeded, {} failed, {} skipped, {} canceled in {:.2}s",
            self.succeeded(),
            self.failed(),
            self.skipped(),
            self.canceled(),
            self.total_duration.as_secs_f64()
        )
    }
}

/// Shared flag telling executors to stop dispatching new actions
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    /// New, not canceled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Cancel when the process receives Ctrl-C
    ///
    /// Must be called from within a tokio runtime.
    pub fn cancel_on_ctrl_c(&self) {
        let flag = self.clone();
        let _ = tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    warn!("Ctrl-C received, letting running actions finish");
                    flag.cancel();
                }
                Err(e) => debug!("Unable to listen for Ctrl-C: {}", e),
            }
        });
    }
}

/// Runs a set of linked actions
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Executor name for logs
    fn name(&self) -> &str;

    /// Run `ids` (a subset of `actions`) in dependency order
    ///
    /// Returns the per-action summary; failures are reported in the summary,
    /// not as an error. On success every produced item's cached info is reset
    /// and its command line is recorded in `history`.
    async fn execute(
        &self,
        actions: &[LinkedAction],
        ids: &[ActionId],
        history: &ActionHistory,
    ) -> BuildResult<ExecutionSummary>;
}
