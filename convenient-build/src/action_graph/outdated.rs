//! Outdated action detection
//!
//! An action is outdated when any of the following holds:
//! - it produces nothing, or one of its produced items is missing
//! - a prerequisite item is newer than its oldest produced item
//! - its command line differs from the one recorded in the action history
//! - its dependency list is missing, unparseable, or names a newer file
//! - one of its prerequisite actions is outdated
//!
//! Import libraries produced by prerequisite actions are exempt from the
//! timestamp check when `ignore_outdated_import_libraries` is set.
//!
//! Results are memoized per action in an [`OutdatedActionMap`] that many
//! worker threads share. Each traversal walks an explicit stack and reports a
//! cycle when it meets an action already on that stack.

use crate::action_history::ActionHistory;
use crate::cache::CppDependencyCache;
use crate::error::{BuildError, BuildResult};
use crate::file_item::{FileItem, FileItemRegistry};
use crate::linked_action::{ActionId, LinkedAction};
use dashmap::DashMap;
use rayon::prelude::*;
use std::collections::HashSet;
use std::time::SystemTime;
use tracing::{debug, info};

/// Memoized outdated flag per action id
#[derive(Debug, Default)]
pub struct OutdatedActionMap {
    memo: DashMap<ActionId, bool>,
}

impl OutdatedActionMap {
    /// Empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Memoized result, if computed
    pub fn get(&self, id: ActionId) -> Option<bool> {
        self.memo.get(&id).map(|entry| *entry.value())
    }

    /// Ids of every outdated action, ascending
    pub fn outdated_ids(&self) -> Vec<ActionId> {
        let mut ids: Vec<ActionId> = self
            .memo
            .iter()
            .filter(|entry| *entry.value())
            .map(|entry| *entry.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Number of evaluated actions
    pub fn len(&self) -> usize {
        self.memo.len()
    }

    /// Whether nothing has been evaluated
    pub fn is_empty(&self) -> bool {
        self.memo.is_empty()
    }

    /// Forget everything, e.g. after the graph was patched and re-linked
    pub fn clear(&self) {
        self.memo.clear();
    }
}

/// Shared state consulted while checking actions
#[derive(Clone, Copy)]
pub struct OutdatedContext<'a> {
    /// Interning table used to resolve dependency-list entries
    pub registry: &'a FileItemRegistry,

    /// Recorded command lines
    pub history: &'a ActionHistory,

    /// Parsed dependency lists
    pub dependency_cache: &'a CppDependencyCache,

    /// Compare command lines against the history
    pub use_action_history: bool,

    /// Skip edges that only carry import libraries
    pub ignore_outdated_import_libraries: bool,

    /// Log the reason for every outdated action at info level
    pub print_debug_info: bool,
}

impl<'a> OutdatedContext<'a> {
    fn report(&self, action: &LinkedAction, reason: &str) {
        if self.print_debug_info {
            info!("{}: {}", action.description(), reason);
        } else {
            debug!("{}: {}", action.description(), reason);
        }
    }
}

/// Check one action, evaluating its prerequisites as needed
pub fn is_action_outdated(
    actions: &[LinkedAction],
    id: ActionId,
    context: &OutdatedContext<'_>,
    map: &OutdatedActionMap,
) -> BuildResult<bool> {
    if let Some(outdated) = map.get(id) {
        return Ok(outdated);
    }

    // Iterative depth-first walk; prerequisite chains may be arbitrarily deep
    let mut stack = vec![Frame::enter(actions, id, context)];
    let mut on_stack = HashSet::from([id]);
    while let Some(frame) = stack.last_mut() {
        let Some(prerequisite) = frame.pending.pop() else {
            let (finished, outdated) = (frame.id, frame.outdated);
            let _ = stack.pop();
            let _ = on_stack.remove(&finished);
            let _ = map.memo.insert(finished, outdated);
            match stack.last_mut() {
                Some(parent) => parent.prerequisite_done(actions, finished, outdated, context),
                None => return Ok(outdated),
            }
            continue;
        };
        let action = &actions[frame.id];

        if context.ignore_outdated_import_libraries
            && only_consumes_import_libraries(action, &actions[prerequisite])
        {
            continue;
        }
        if let Some(outdated) = map.get(prerequisite) {
            frame.prerequisite_done(actions, prerequisite, outdated, context);
        } else if on_stack.insert(prerequisite) {
            stack.push(Frame::enter(actions, prerequisite, context));
        } else {
            let start = stack
                .iter()
                .position(|frame| frame.id == prerequisite)
                .unwrap_or(0);
            return Err(BuildError::CyclicDependency(
                stack[start..]
                    .iter()
                    .map(|frame| actions[frame.id].description())
                    .collect(),
            ));
        }
    }
    Ok(map.get(id).unwrap_or_default())
}

/// One action whose prerequisite actions are being walked
struct Frame {
    id: ActionId,
    // Prerequisite actions still to visit, popped in ascending order
    pending: Vec<ActionId>,
    outdated: bool,
}

impl Frame {
    fn enter(actions: &[LinkedAction], id: ActionId, context: &OutdatedContext<'_>) -> Self {
        let outdated = match local_outdated_reason(actions, &actions[id], context) {
            Some(reason) => {
                context.report(&actions[id], &reason);
                true
            }
            None => false,
        };
        Self {
            id,
            pending: actions[id].prerequisite_actions.iter().rev().copied().collect(),
            outdated,
        }
    }

    fn prerequisite_done(
        &mut self,
        actions: &[LinkedAction],
        prerequisite: ActionId,
        outdated: bool,
        context: &OutdatedContext<'_>,
    ) {
        if outdated && !self.outdated {
            context.report(
                &actions[self.id],
                &format!(
                    "prerequisite action '{}' is outdated",
                    actions[prerequisite].description()
                ),
            );
            self.outdated = true;
        }
    }
}

fn only_consumes_import_libraries(consumer: &LinkedAction, producer: &LinkedAction) -> bool {
    if !producer.produces_import_library() {
        return false;
    }
    let mut consumed = consumer
        .prerequisite_items()
        .iter()
        .filter(|item| producer.produced_items().contains(*item))
        .peekable();
    consumed.peek().is_some() && consumed.all(|item| producer.is_import_library(item))
}

/// Import library produced by one of `action`'s prerequisite actions
///
/// Relinking a module rewrites its import library even when the exported
/// interface is unchanged, so its timestamp says nothing about consumers.
fn is_prerequisite_import_library(
    actions: &[LinkedAction],
    action: &LinkedAction,
    item: &FileItem,
) -> bool {
    action.prerequisite_actions.iter().any(|&producer| {
        let producer = &actions[producer];
        producer.is_import_library(item)
            && producer
                .produced_items()
                .iter()
                .any(|produced| produced.location() == item.location())
    })
}

fn local_outdated_reason(
    actions: &[LinkedAction],
    action: &LinkedAction,
    context: &OutdatedContext<'_>,
) -> Option<String> {
    if action.produced_items().is_empty() {
        return Some("produces no items".to_string());
    }

    let mut oldest_output: Option<SystemTime> = None;
    for item in action.produced_items() {
        if !item.exists() {
            return Some(format!("produced item '{}' does not exist", item));
        }
        let Some(modified) = item.last_write_time() else {
            return Some(format!("produced item '{}' has no timestamp", item));
        };
        oldest_output = Some(oldest_output.map_or(modified, |oldest| oldest.min(modified)));
    }
    let oldest_output = oldest_output?;

    for item in action.prerequisite_items() {
        let Some(modified) = item.last_write_time() else {
            continue;
        };
        if modified <= oldest_output {
            continue;
        }
        if context.ignore_outdated_import_libraries
            && is_prerequisite_import_library(actions, action, item)
        {
            continue;
        }
        return Some(format!("prerequisite '{}' is newer than the outputs", item));
    }

    if context.use_action_history && action.use_action_history() {
        let command_line = action.command_line();
        for item in action.produced_items() {
            if context.history.has_changed(item, &command_line) {
                return Some(format!("command line for '{}' changed", item));
            }
        }
    }

    if let Some(list) = action.dependency_list_file() {
        if !list.exists() {
            return Some(format!("dependency list '{}' is missing", list));
        }
        match context.dependency_cache.try_get_dependencies(
            list,
            action.working_directory(),
            context.registry,
        ) {
            None => return Some(format!("dependency list '{}' is unreadable", list)),
            Some(dependencies) => {
                for dependency in dependencies {
                    match dependency.last_write_time() {
                        None => {
                            return Some(format!(
                                "included file '{}' no longer exists",
                                dependency
                            ));
                        }
                        Some(modified) if modified > oldest_output => {
                            return Some(format!(
                                "included file '{}' is newer than the outputs",
                                dependency
                            ));
                        }
                        Some(_) => {}
                    }
                }
            }
        }
    }

    None
}

/// Evaluate every action in parallel, filling `map`
pub fn gather_all_outdated_actions(
    actions: &[LinkedAction],
    context: &OutdatedContext<'_>,
    map: &OutdatedActionMap,
) -> BuildResult<()> {
    (0..actions.len())
        .into_par_iter()
        .try_for_each(|id| is_action_outdated(actions, id, context, map).map(|_| ()))?;
    debug!(
        "{} of {} actions are outdated",
        map.outdated_ids().len(),
        actions.len()
    );
    Ok(())
}

/// Outdated members of `subset`, ascending
pub fn get_outdated_actions(
    actions: &[LinkedAction],
    subset: &[ActionId],
    context: &OutdatedContext<'_>,
    map: &OutdatedActionMap,
) -> BuildResult<Vec<ActionId>> {
    let flags = subset
        .par_iter()
        .map(|&id| is_action_outdated(actions, id, context, map).map(|outdated| (id, outdated)))
        .collect::<BuildResult<Vec<_>>>()?;
    let mut outdated: Vec<ActionId> = flags
        .into_iter()
        .filter(|(_, outdated)| *outdated)
        .map(|(id, _)| id)
        .collect();
    outdated.sort_unstable();
    Ok(outdated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionType};
    use crate::action_graph::link;
    use filetime::{FileTime, set_file_mtime};
    use std::collections::BTreeSet;
    use std::path::Path;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        root: std::path::PathBuf,
        registry: FileItemRegistry,
        history: ActionHistory,
        dependency_cache: CppDependencyCache,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let root = tmp.path().to_path_buf();
            Self {
                _tmp: tmp,
                root,
                registry: FileItemRegistry::new(),
                history: ActionHistory::in_memory(),
                dependency_cache: CppDependencyCache::in_memory(),
            }
        }

        fn touch(&self, name: &str, seconds: i64) {
            let path = self.root.join(name);
            std::fs::write(&path, name).unwrap();
            set_file_mtime(&path, FileTime::from_unix_time(seconds, 0)).unwrap();
            self.registry.get_item_by_path(&path).reset_cached_info();
        }

        fn action(&self, kind: ActionType, inputs: &[&str], output: &str) -> LinkedAction {
            let mut builder = Action::builder(kind)
                .command("/bin/true")
                .arg(output)
                .status_description(output);
            for input in inputs {
                builder = builder.prerequisite(self.registry.get_item_by_path(self.root.join(input)));
            }
            builder = builder.produces(self.registry.get_item_by_path(self.root.join(output)));
            LinkedAction::new(builder.build(), None)
        }

        fn context(&self, use_history: bool) -> OutdatedContext<'_> {
            OutdatedContext {
                registry: &self.registry,
                history: &self.history,
                dependency_cache: &self.dependency_cache,
                use_action_history: use_history,
                ignore_outdated_import_libraries: true,
                print_debug_info: false,
            }
        }

        fn record_all(&self, actions: &[LinkedAction]) {
            for action in actions {
                for item in action.produced_items() {
                    self.history.record(item, &action.command_line());
                }
            }
        }
    }

    fn outdated(actions: &[LinkedAction], context: &OutdatedContext<'_>) -> Vec<ActionId> {
        let map = OutdatedActionMap::new();
        gather_all_outdated_actions(actions, context, &map).unwrap();
        map.outdated_ids()
    }

    #[test]
    fn test_transitive_chain() {
        let fx = Fixture::new();
        for (name, time) in [("c.in", 100), ("c.out", 200), ("b.out", 300), ("a.out", 400)] {
            fx.touch(name, time);
        }
        let mut actions = vec![
            fx.action(ActionType::Link, &["b.out"], "a.out"),
            fx.action(ActionType::Compile, &["c.out"], "b.out"),
            fx.action(ActionType::Compile, &["c.in"], "c.out"),
        ];
        link(&mut actions).unwrap();
        assert!(outdated(&actions, &fx.context(false)).is_empty());

        fx.touch("c.in", 500);
        assert_eq!(outdated(&actions, &fx.context(false)), vec![0, 1, 2]);
    }

    #[test]
    fn test_command_line_change_without_timestamp_change() {
        let fx = Fixture::new();
        fx.touch("a.cpp", 100);
        fx.touch("a.o", 200);
        let actions = vec![fx.action(ActionType::Compile, &["a.cpp"], "a.o")];
        fx.record_all(&actions);
        assert!(outdated(&actions, &fx.context(true)).is_empty());

        let changed = vec![LinkedAction::new(
            actions[0].to_builder().arg("-O3").build(),
            None,
        )];
        assert_eq!(outdated(&changed, &fx.context(true)), vec![0]);
    }

    #[test]
    fn test_dependency_list_reveals_newer_header() {
        let fx = Fixture::new();
        fx.touch("a.cpp", 100);
        fx.touch("a.h", 100);
        fx.touch("a.o", 200);
        let list = fx.root.join("a.d");
        let rule = format!(
            "a.o: {} {}\n",
            fx.root.join("a.cpp").display(),
            fx.root.join("a.h").display()
        );
        std::fs::write(&list, rule).unwrap();
        set_file_mtime(&list, FileTime::from_unix_time(200, 0)).unwrap();

        let base = fx.action(ActionType::Compile, &["a.cpp"], "a.o");
        let actions = vec![LinkedAction::new(
            base.to_builder()
                .dependency_list_file(Some(fx.registry.get_item_by_path(&list)))
                .build(),
            None,
        )];
        assert!(outdated(&actions, &fx.context(false)).is_empty());

        fx.touch("a.h", 300);
        assert_eq!(outdated(&actions, &fx.context(false)), vec![0]);
    }

    #[test]
    fn test_missing_dependency_list_is_outdated() {
        let fx = Fixture::new();
        fx.touch("a.cpp", 100);
        fx.touch("a.o", 200);
        let base = fx.action(ActionType::Compile, &["a.cpp"], "a.o");
        let actions = vec![LinkedAction::new(
            base.to_builder()
                .dependency_list_file(Some(fx.registry.get_item_by_path(fx.root.join("a.d"))))
                .build(),
            None,
        )];
        assert_eq!(outdated(&actions, &fx.context(false)), vec![0]);
    }

    #[test]
    fn test_import_library_edges_can_be_ignored() {
        let fx = Fixture::new();
        fx.touch("core.cpp", 500);
        fx.touch("core.lib", 200);
        fx.touch("core.dll", 200);
        fx.touch("game.dll", 300);

        let core = LinkedAction::new(
            Action::builder(ActionType::Link)
                .command("/bin/true")
                .prerequisite(fx.registry.get_item_by_path(fx.root.join("core.cpp")))
                .produces(fx.registry.get_item_by_path(fx.root.join("core.dll")))
                .produces(fx.registry.get_item_by_path(fx.root.join("core.lib")))
                .produces_import_library(true)
                .build(),
            None,
        );
        let game = fx.action(ActionType::Link, &["core.lib"], "game.dll");
        let mut actions = vec![core, game];
        link(&mut actions).unwrap();

        assert_eq!(outdated(&actions, &fx.context(false)), vec![0]);

        let mut strict = fx.context(false);
        strict.ignore_outdated_import_libraries = false;
        assert_eq!(outdated(&actions, &strict), vec![0, 1]);
    }

    #[test]
    fn test_relinked_import_library_leaves_consumer_up_to_date() {
        let fx = Fixture::new();
        fx.touch("core.cpp", 100);
        fx.touch("core.dll", 200);
        fx.touch("core.lib", 200);
        fx.touch("game.dll", 300);

        let core = LinkedAction::new(
            Action::builder(ActionType::Link)
                .command("/bin/true")
                .prerequisite(fx.registry.get_item_by_path(fx.root.join("core.cpp")))
                .produces(fx.registry.get_item_by_path(fx.root.join("core.dll")))
                .produces(fx.registry.get_item_by_path(fx.root.join("core.lib")))
                .produces_import_library(true)
                .build(),
            None,
        );
        let game = fx.action(ActionType::Link, &["core.lib"], "game.dll");
        let mut actions = vec![core, game];
        link(&mut actions).unwrap();
        assert!(outdated(&actions, &fx.context(false)).is_empty());

        fx.touch("core.cpp", 400);
        assert_eq!(outdated(&actions, &fx.context(false)), vec![0]);

        // core relinked, rewriting its import library
        fx.touch("core.dll", 500);
        fx.touch("core.lib", 500);
        assert!(outdated(&actions, &fx.context(false)).is_empty());

        let mut strict = fx.context(false);
        strict.ignore_outdated_import_libraries = false;
        assert_eq!(outdated(&actions, &strict), vec![1]);
    }

    #[test]
    fn test_dependency_list_entries_relative_to_working_directory() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.root.join("src")).unwrap();
        std::fs::create_dir_all(fx.root.join("obj")).unwrap();
        fx.touch("src/a.cpp", 100);
        fx.touch("src/a.h", 100);
        fx.touch("obj/a.o", 200);
        let list = fx.root.join("obj/a.d");
        std::fs::write(&list, "obj/a.o: src/a.cpp src/a.h\n").unwrap();
        set_file_mtime(&list, FileTime::from_unix_time(200, 0)).unwrap();

        let base = fx.action(ActionType::Compile, &["src/a.cpp"], "obj/a.o");
        let actions = vec![LinkedAction::new(
            base.to_builder()
                .working_directory(&fx.root)
                .dependency_list_file(Some(fx.registry.get_item_by_path(&list)))
                .build(),
            None,
        )];
        assert!(outdated(&actions, &fx.context(false)).is_empty());

        fx.touch("src/a.h", 300);
        assert_eq!(outdated(&actions, &fx.context(false)), vec![0]);
    }

    #[test]
    fn test_deleted_included_file_is_outdated() {
        let fx = Fixture::new();
        fx.touch("a.cpp", 100);
        fx.touch("a.h", 100);
        fx.touch("a.o", 200);
        let list = fx.root.join("a.d");
        std::fs::write(&list, "a.o: a.cpp a.h\n").unwrap();
        set_file_mtime(&list, FileTime::from_unix_time(200, 0)).unwrap();

        let base = fx.action(ActionType::Compile, &["a.cpp"], "a.o");
        let actions = vec![LinkedAction::new(
            base.to_builder()
                .working_directory(&fx.root)
                .dependency_list_file(Some(fx.registry.get_item_by_path(&list)))
                .build(),
            None,
        )];
        assert!(outdated(&actions, &fx.context(false)).is_empty());

        std::fs::remove_file(fx.root.join("a.h")).unwrap();
        fx.registry.reset_all_cached_info();
        assert_eq!(outdated(&actions, &fx.context(false)), vec![0]);
    }

    #[test]
    fn test_deep_chain_on_a_small_stack() {
        const DEPTH: usize = 20_000;
        let fx = Fixture::new();
        fx.touch("step0.out", 100);
        let mut actions: Vec<LinkedAction> = (1..=DEPTH)
            .map(|i| {
                let input = format!("step{}.out", i - 1);
                fx.action(ActionType::Compile, &[input.as_str()], &format!("step{i}.out"))
            })
            .collect();
        link(&mut actions).unwrap();

        let context = fx.context(false);
        let map = OutdatedActionMap::new();
        let top = DEPTH - 1;
        let outdated = std::thread::scope(|scope| {
            std::thread::Builder::new()
                .stack_size(256 * 1024)
                .spawn_scoped(scope, || is_action_outdated(&actions, top, &context, &map))
                .unwrap()
                .join()
                .unwrap()
        })
        .unwrap();
        assert!(outdated);
        assert_eq!(map.len(), DEPTH);
    }

    #[test]
    fn test_cycle_is_reported_not_followed() {
        let fx = Fixture::new();
        let mut actions = vec![
            fx.action(ActionType::Compile, &["b.out"], "a.out"),
            fx.action(ActionType::Compile, &["a.out"], "b.out"),
        ];
        actions[0].prerequisite_actions = BTreeSet::from([1]);
        actions[1].prerequisite_actions = BTreeSet::from([0]);

        let error = is_action_outdated(&actions, 0, &fx.context(false), &OutdatedActionMap::new())
            .unwrap_err();
        match error {
            BuildError::CyclicDependency(members) => assert_eq!(members.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_concurrent_evaluation_matches_sequential() {
        let fx = Fixture::new();
        let mut actions = Vec::new();
        for i in 0..64 {
            let source = format!("s{i}.cpp");
            let object = format!("s{i}.o");
            fx.touch(&source, if i % 3 == 0 { 300 } else { 100 });
            fx.touch(&object, 200);
            actions.push(fx.action(ActionType::Compile, &[source.as_str()], &object));
        }
        let objects: Vec<String> = (0..64).map(|i| format!("s{i}.o")).collect();
        let inputs: Vec<&str> = objects.iter().map(String::as_str).collect();
        fx.touch("game", 250);
        actions.push(fx.action(ActionType::Link, &inputs, "game"));
        link(&mut actions).unwrap();

        let context = fx.context(false);
        let parallel = outdated(&actions, &context);

        let sequential_map = OutdatedActionMap::new();
        let sequential: Vec<ActionId> = (0..actions.len())
            .filter(|&id| is_action_outdated(&actions, id, &context, &sequential_map).unwrap())
            .collect();
        assert_eq!(parallel, sequential);
        assert!(parallel.contains(&64));
        assert!(Path::new(&fx.root).exists());
    }
}
