//! Action graph: linking, validation, ordering, and pre-execution side effects
//!
//! The graph is a slice of [`LinkedAction`]s. Edges are computed from file
//! sets: an action depends on every action producing one of its
//! prerequisite items. Items nobody produces are external inputs.

pub mod export;
pub mod outdated;

pub use export::{ImportedGraph, export_json, import_json};
pub use outdated::{
    OutdatedActionMap, OutdatedContext, gather_all_outdated_actions, get_outdated_actions,
    is_action_outdated,
};

use crate::action_history::ActionHistory;
use crate::error::{BuildError, BuildResult, ProducerConflict};
use crate::file_item::FileItem;
use crate::linked_action::{ActionId, LinkedAction};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Map every produced item to its producing action
///
/// Fails with every conflicting item when two actions claim the same file.
pub fn check_for_conflicts(
    actions: &[LinkedAction],
) -> BuildResult<HashMap<Arc<FileItem>, ActionId>> {
    let mut producers: HashMap<Arc<FileItem>, ActionId> = HashMap::new();
    let mut conflicts: BTreeMap<Arc<FileItem>, BTreeSet<ActionId>> = BTreeMap::new();

    for (id, action) in actions.iter().enumerate() {
        for item in action.produced_items() {
            match producers.get(item) {
                Some(&existing) if existing != id => {
                    let claimants = conflicts.entry(Arc::clone(item)).or_default();
                    let _ = claimants.insert(existing);
                    let _ = claimants.insert(id);
                }
                Some(_) => {}
                None => {
                    let _ = producers.insert(Arc::clone(item), id);
                }
            }
        }
    }

    if conflicts.is_empty() {
        return Ok(producers);
    }

    let conflicts = conflicts
        .into_iter()
        .map(|(item, ids)| ProducerConflict {
            produced_item: item.location().to_path_buf(),
            actions: ids
                .into_iter()
                .map(|id| actions[id].description())
                .collect(),
        })
        .collect::<Vec<_>>();
    for conflict in &conflicts {
        warn!("{}", conflict);
    }
    Err(BuildError::ConflictingProducers(conflicts))
}

/// Resolve prerequisite actions for every action
///
/// Input order is irrelevant and linking is idempotent, so patched graphs are
/// simply linked again. Conflicting producers and cycles are errors.
pub fn link(actions: &mut [LinkedAction]) -> BuildResult<()> {
    let producers = check_for_conflicts(actions)?;

    for action in actions.iter_mut() {
        let prerequisites = action
            .prerequisite_items()
            .iter()
            .filter_map(|item| producers.get(item).copied())
            .collect();
        action.prerequisite_actions = prerequisites;
    }

    check_for_cycles(actions)?;
    debug!("Linked {} actions", actions.len());
    Ok(())
}

/// Fail if the linked graph contains a cycle, naming the actions on it
pub fn check_for_cycles(actions: &[LinkedAction]) -> BuildResult<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        Visiting,
        Done,
    }

    let mut marks = vec![Mark::Unvisited; actions.len()];
    for root in 0..actions.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        // Iterative DFS; each frame holds the node and its remaining edges
        let mut stack: Vec<(ActionId, Vec<ActionId>)> = Vec::new();
        marks[root] = Mark::Visiting;
        stack.push((root, actions[root].prerequisite_actions.iter().copied().collect()));

        while let Some((node, pending)) = stack.last_mut() {
            let node = *node;
            match pending.pop() {
                Some(next) if next >= actions.len() => {
                    return Err(BuildError::msg(format!(
                        "Action {} references unknown action {}",
                        actions[node].description(),
                        next
                    )));
                }
                Some(next) => match marks[next] {
                    Mark::Unvisited => {
                        marks[next] = Mark::Visiting;
                        let edges = actions[next].prerequisite_actions.iter().copied().collect();
                        stack.push((next, edges));
                    }
                    Mark::Visiting => {
                        let start = stack
                            .iter()
                            .position(|(id, _)| *id == next)
                            .unwrap_or(0);
                        let mut cycle: Vec<String> = stack[start..]
                            .iter()
                            .map(|(id, _)| actions[*id].description())
                            .collect();
                        cycle.push(actions[next].description());
                        return Err(BuildError::CyclicDependency(cycle));
                    }
                    Mark::Done => {}
                },
                None => {
                    marks[node] = Mark::Done;
                    let _ = stack.pop();
                }
            }
        }
    }
    Ok(())
}

/// Warn about (or reject) produced paths longer than `max_length`
pub fn check_path_lengths(
    actions: &[LinkedAction],
    max_length: usize,
    is_error: bool,
) -> BuildResult<()> {
    if max_length == 0 {
        return Ok(());
    }
    let mut reported = HashSet::new();
    for action in actions {
        for item in action.produced_items() {
            let length = item.location().as_os_str().len();
            if length <= max_length || !reported.insert(Arc::clone(item)) {
                continue;
            }
            if is_error {
                return Err(BuildError::PathTooLong {
                    path: item.location().to_path_buf(),
                    max: max_length,
                });
            }
            warn!(
                "Path exceeds {} characters ({}): {}",
                max_length,
                length,
                item.location().display()
            );
        }
    }
    Ok(())
}

/// Actions needed to produce `desired_items`, in ascending id order
///
/// Walks backwards from the producers of the desired items through their
/// transitive prerequisite actions. Desired items nobody produces are
/// ignored.
pub fn gather_prerequisite_actions(
    actions: &[LinkedAction],
    desired_items: &[Arc<FileItem>],
) -> Vec<ActionId> {
    let desired: HashSet<&Arc<FileItem>> = desired_items.iter().collect();
    let mut stack: Vec<ActionId> = actions
        .iter()
        .enumerate()
        .filter(|(_, action)| {
            action
                .produced_items()
                .iter()
                .any(|item| desired.contains(item))
        })
        .map(|(id, _)| id)
        .collect();

    let mut needed = BTreeSet::new();
    while let Some(id) = stack.pop() {
        if needed.insert(id) {
            stack.extend(actions[id].prerequisite_actions.iter().copied());
        }
    }
    needed.into_iter().collect()
}

/// Order `subset` so every action comes after its prerequisites
///
/// Edges to actions outside the subset are ignored. Ties are broken by id,
/// so the order is deterministic.
pub fn topological_order(actions: &[LinkedAction], subset: &[ActionId]) -> BuildResult<Vec<ActionId>> {
    let members: HashSet<ActionId> = subset.iter().copied().collect();
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

    let mut ready: BTreeSet<ActionId> = remaining
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(members.len());
    while let Some(id) = ready.pop_first() {
        order.push(id);
        for &dependent in dependents.get(&id).into_iter().flatten() {
            if let Some(count) = remaining.get_mut(&dependent) {
                *count -= 1;
                if *count == 0 {
                    let _ = ready.insert(dependent);
                }
            }
        }
    }

    if order.len() != members.len() {
        let stuck: Vec<String> = remaining
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(id, _)| actions[*id].description())
            .collect();
        return Err(BuildError::CyclicDependency(stuck));
    }
    Ok(order)
}

/// Create the output directories of `ids` up front
pub fn create_directories_for_produced_items(
    actions: &[LinkedAction],
    ids: &[ActionId],
) -> BuildResult<()> {
    let directories: BTreeSet<_> = ids
        .iter()
        .flat_map(|&id| actions[id].produced_items())
        .filter_map(|item| item.location().parent().map(|p| p.to_path_buf()))
        .collect();
    for directory in &directories {
        std::fs::create_dir_all(directory)?;
    }
    debug!("Created {} output directories", directories.len());
    Ok(())
}

/// Delete stale outputs of the actions about to run
///
/// Each deleted item also loses its history entry, so an interrupted build
/// cannot leave a fresh-looking stale file behind.
pub fn delete_outdated_produced_items(
    actions: &[LinkedAction],
    outdated: &[ActionId],
    history: &ActionHistory,
) -> BuildResult<()> {
    let mut deleted = 0usize;
    for &id in outdated {
        let action = &actions[id];
        for item in action.produced_items().iter().chain(action.delete_items()) {
            if item.exists() && !item.is_directory() {
                debug!("Deleting outdated item: {}", item);
                match std::fs::remove_file(item.location()) {
                    Ok(()) => deleted += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                item.reset_cached_info();
            }
            history.forget(item);
        }
    }
    if deleted > 0 {
        info!("Deleted {} outdated produced items", deleted);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionType};
    use crate::file_item::FileItemRegistry;

    fn action(registry: &FileItemRegistry, inputs: &[&str], outputs: &[&str]) -> LinkedAction {
        let mut builder = Action::builder(ActionType::Compile).command("/bin/true");
        for input in inputs {
            builder = builder.prerequisite(registry.get_item_by_path(input));
        }
        for output in outputs {
            builder = builder
                .produces(registry.get_item_by_path(output))
                .status_description(*output);
        }
        LinkedAction::new(builder.build(), None)
    }

    fn scenario(registry: &FileItemRegistry) -> Vec<LinkedAction> {
        vec![
            action(registry, &["/p/a.o", "/p/b.o"], &["/p/t.exe"]),
            action(registry, &["/p/a.cpp"], &["/p/a.o"]),
            action(registry, &["/p/b.cpp"], &["/p/b.o"]),
        ]
    }

    #[test]
    fn test_link_resolves_edges_in_any_order() {
        let registry = FileItemRegistry::new();
        let mut actions = scenario(&registry);
        link(&mut actions).unwrap();
        assert_eq!(
            actions[0].prerequisite_actions,
            BTreeSet::from([1, 2])
        );
        assert!(actions[1].prerequisite_actions.is_empty());

        // Re-linking is idempotent
        link(&mut actions).unwrap();
        assert_eq!(actions[0].prerequisite_actions.len(), 2);
    }

    #[test]
    fn test_conflicting_producers_fail() {
        let registry = FileItemRegistry::new();
        let mut actions = vec![
            action(&registry, &["/p/a.cpp"], &["/p/a.o"]),
            action(&registry, &["/p/other.cpp"], &["/p/a.o"]),
        ];
        let err = link(&mut actions).unwrap_err();
        match err {
            BuildError::ConflictingProducers(conflicts) => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].actions.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cycle_is_reported() {
        let registry = FileItemRegistry::new();
        let mut actions = vec![
            action(&registry, &["/p/b"], &["/p/a"]),
            action(&registry, &["/p/c"], &["/p/b"]),
            action(&registry, &["/p/a"], &["/p/c"]),
        ];
        match link(&mut actions).unwrap_err() {
            BuildError::CyclicDependency(cycle) => assert_eq!(cycle.len(), 4),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_gather_prerequisites_for_single_output() {
        let registry = FileItemRegistry::new();
        let mut actions = scenario(&registry);
        link(&mut actions).unwrap();

        let only_a = gather_prerequisite_actions(&actions, &[registry.get_item_by_path("/p/a.o")]);
        assert_eq!(only_a, vec![1]);

        let all = gather_prerequisite_actions(&actions, &[registry.get_item_by_path("/p/t.exe")]);
        assert_eq!(all, vec![0, 1, 2]);
    }

    #[test]
    fn test_topological_order_puts_link_last() {
        let registry = FileItemRegistry::new();
        let mut actions = scenario(&registry);
        link(&mut actions).unwrap();
        let order = topological_order(&actions, &[0, 1, 2]).unwrap();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn test_path_length_check() {
        let registry = FileItemRegistry::new();
        let actions = vec![action(&registry, &[], &["/p/a/very/long/path/output.o"])];
        assert!(check_path_lengths(&actions, 10, false).is_ok());
        assert!(matches!(
            check_path_lengths(&actions, 10, true),
            Err(BuildError::PathTooLong { max: 10, .. })
        ));
        assert!(check_path_lengths(&actions, 0, true).is_ok());
    }
}
