//! Running one action's process and sizing the worker pool

use super::ActionOutcome;
use crate::action::Action;
use crate::config::BuildConfiguration;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

const GIGABYTE: f64 = 1024.0 * 1024.0 * 1024.0;

/// Total physical memory, if the platform exposes it
pub fn physical_memory_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        parse_meminfo_total(&meminfo)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

fn parse_meminfo_total(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|line| line.starts_with("MemTotal:"))?;
    let kilobytes: u64 = line
        .trim_start_matches("MemTotal:")
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kilobytes * 1024)
}

/// Number of concurrent action slots
///
/// An explicit `max_parallel_actions` wins. Otherwise the logical processor
/// count times the multiplier, capped by how many actions of
/// `memory_per_action_gb` fit into physical memory.
pub fn compute_max_parallel_actions(config: &BuildConfiguration, memory_per_action_gb: f64) -> usize {
    if config.max_parallel_actions > 0 {
        return config.max_parallel_actions;
    }
    let by_processors =
        ((num_cpus::get() as f64) * config.processor_count_multiplier.max(0.0)).floor() as usize;
    let mut slots = by_processors.max(1);

    if memory_per_action_gb > 0.0
        && let Some(memory) = physical_memory_bytes()
    {
        let by_memory = (memory as f64 / (memory_per_action_gb * GIGABYTE)).floor() as usize;
        if by_memory < slots {
            debug!(
                "Limiting parallelism to {} by memory ({:.1} GB per action)",
                by_memory.max(1),
                memory_per_action_gb
            );
            slots = by_memory.max(1);
        }
    }
    slots
}

/// Captured result of one process run
pub(crate) struct ProcessRun {
    pub outcome: ActionOutcome,
    pub output: String,
    pub duration: Duration,
}

/// Run the action's command, capturing its output
pub(crate) async fn run_action_process(action: &Action) -> ProcessRun {
    let started = Instant::now();
    for item in action.delete_items() {
        let _ = std::fs::remove_file(item.location());
    }

    let mut command = Command::new(action.command_path());
    command
        .args(action.command_arguments())
        .envs(action.environment())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);
    if !action.working_directory().as_os_str().is_empty() {
        command.current_dir(action.working_directory());
    }
    // Untranslated GCC diagnostics, unless the action chose a locale
    if action.is_gcc_compiler() && !action.environment().contains_key("LC_MESSAGES") {
        command.env("LC_MESSAGES", "C");
    }

    match command.output().await {
        Ok(output) => {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            let outcome = if output.status.success() {
                ActionOutcome::Succeeded
            } else {
                ActionOutcome::Failed {
                    exit_code: output.status.code(),
                }
            };
            ProcessRun {
                outcome,
                output: text,
                duration: started.elapsed(),
            }
        }
        Err(e) => ProcessRun {
            outcome: ActionOutcome::Failed { exit_code: None },
            output: format!(
                "Unable to start {}: {}",
                action.command_path().display(),
                e
            ),
            duration: started.elapsed(),
        },
    }
}
