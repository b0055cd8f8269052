//! Merging the action lists of several targets into one graph

use crate::error::{BuildError, BuildResult, ProducerConflict};
use crate::file_item::FileItem;
use crate::linked_action::LinkedAction;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Merge per-target action lists, sharing actions that produce the same files
///
/// Two actions writing the same item collapse into one when their command
/// lines and produced sets agree; the survivor carries both targets' group
/// names. Disagreeing producers are a conflict and nothing is merged.
/// Actions without produced items are shared when their command lines match.
pub fn merge_actions(target_actions: Vec<Vec<LinkedAction>>) -> BuildResult<Vec<LinkedAction>> {
    let mut merged: Vec<LinkedAction> = Vec::new();
    let mut by_produced: HashMap<Arc<FileItem>, usize> = HashMap::new();
    let mut by_command_line: HashMap<String, usize> = HashMap::new();
    let mut conflicts: BTreeMap<Arc<FileItem>, Vec<String>> = BTreeMap::new();
    let mut shared = 0usize;

    for action in target_actions.into_iter().flatten() {
        let existing = if action.produced_items().is_empty() {
            by_command_line.get(&action.command_line()).copied()
        } else {
            action
                .produced_items()
                .iter()
                .find_map(|item| by_produced.get(item).copied())
        };

        match existing {
            Some(index) => {
                let other = &merged[index];
                let same_outputs = other.produced_items() == action.produced_items();
                if same_outputs && other.command_line() == action.command_line() {
                    merged[index].absorb(&action);
                    shared += 1;
                    continue;
                }
                for item in action.produced_items() {
                    if let Some(&owner) = by_produced.get(item) {
                        let entry = conflicts.entry(Arc::clone(item)).or_default();
                        if entry.is_empty() {
                            entry.push(describe(&merged[owner]));
                        }
                        entry.push(describe(&action));
                    }
                }
            }
            None => {
                let index = merged.len();
                for item in action.produced_items() {
                    let _ = by_produced.insert(Arc::clone(item), index);
                }
                if action.produced_items().is_empty() {
                    let _ = by_command_line.insert(action.command_line(), index);
                }
                merged.push(action);
            }
        }
    }

    if !conflicts.is_empty() {
        return Err(BuildError::ConflictingProducers(
            conflicts
                .into_iter()
                .map(|(item, actions)| ProducerConflict {
                    produced_item: item.location().to_path_buf(),
                    actions,
                })
                .collect(),
        ));
    }
    debug!(
        "Merged actions: {} unique, {} shared between targets",
        merged.len(),
        shared
    );
    Ok(merged)
}

fn describe(action: &LinkedAction) -> String {
    let groups: Vec<&str> = action.group_names.iter().map(String::as_str).collect();
    format!(
        "{} [{}] ({})",
        action.description(),
        groups.join(", "),
        action.command_line()
    )
}
