//! JSON hand-off format for executing an action list out of process

use crate::action::SerializedAction;
use crate::error::{BuildError, BuildResult};
use crate::file_item::FileItemRegistry;
use crate::linked_action::{ActionId, LinkedAction};
use crate::persist::atomic_write;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::info;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ExportedGraph {
    #[serde(default)]
    environment: BTreeMap<String, String>,
    actions: Vec<ExportedAction>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ExportedAction {
    id: usize,
    #[serde(flatten)]
    action: SerializedAction,
    #[serde(default)]
    dependencies: Vec<usize>,
}

/// Actions and environment read back from an exported graph
#[derive(Debug)]
pub struct ImportedGraph {
    /// Linked actions; edges come from the exported `Dependencies`
    pub actions: Vec<LinkedAction>,

    /// Environment captured at export time
    pub environment: BTreeMap<String, String>,
}

/// Write `ids` (a subset of `actions`) to `path`
///
/// Exported ids are renumbered densely; edges to actions outside the subset
/// are dropped.
pub fn export_json(
    path: &Path,
    actions: &[LinkedAction],
    ids: &[ActionId],
    environment: &BTreeMap<String, String>,
) -> BuildResult<()> {
    let renumbered: HashMap<ActionId, usize> = ids
        .iter()
        .enumerate()
        .map(|(new_id, &id)| (id, new_id))
        .collect();

    let exported = ExportedGraph {
        environment: environment.clone(),
        actions: ids
            .iter()
            .enumerate()
            .map(|(new_id, &id)| ExportedAction {
                id: new_id,
                action: actions[id].to_serialized(),
                dependencies: actions[id]
                    .prerequisite_actions
                    .iter()
                    .filter_map(|prerequisite| renumbered.get(prerequisite).copied())
                    .collect(),
            })
            .collect(),
    };

    let json = serde_json::to_vec_pretty(&exported)?;
    atomic_write(path, &json)?;
    info!("Exported {} actions to {}", ids.len(), path.display());
    Ok(())
}

/// Read a graph written by [`export_json`], interning paths through `registry`
pub fn import_json(path: &Path, registry: &FileItemRegistry) -> BuildResult<ImportedGraph> {
    let content = std::fs::read_to_string(path)?;
    let exported: ExportedGraph = serde_json::from_str(&content)?;

    let positions: HashMap<usize, usize> = exported
        .actions
        .iter()
        .enumerate()
        .map(|(position, action)| (action.id, position))
        .collect();
    if positions.len() != exported.actions.len() {
        return Err(BuildError::msg(format!(
            "Duplicate action ids in {}",
            path.display()
        )));
    }

    let mut actions = Vec::with_capacity(exported.actions.len());
    for exported_action in &exported.actions {
        let mut linked = LinkedAction::new(exported_action.action.intern(registry), None);
        for dependency in &exported_action.dependencies {
            let position = positions.get(dependency).ok_or_else(|| {
                BuildError::msg(format!(
                    "Action {} in {} depends on unknown action {}",
                    exported_action.id,
                    path.display(),
                    dependency
                ))
            })?;
            let _ = linked.prerequisite_actions.insert(*position);
        }
        actions.push(linked);
    }

    info!("Imported {} actions from {}", actions.len(), path.display());
    Ok(ImportedGraph {
        actions,
        environment: exported.environment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionType};
    use crate::action_graph::link;
    use std::collections::BTreeSet;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_export_import_round_trip() {
        let tmp = TempDir::new().unwrap();
        let registry = FileItemRegistry::new();
        let item = |name: &str| registry.get_item_by_path(tmp.path().join(name));

        let mut actions = vec![
            LinkedAction::new(
                Action::builder(ActionType::Link)
                    .command("/usr/bin/ld")
                    .args(["a.o", "-o", "game"])
                    .prerequisite(item("a.o"))
                    .produces(item("game"))
                    .build(),
                None,
            ),
            LinkedAction::new(
                Action::builder(ActionType::Compile)
                    .command("/usr/bin/cc")
                    .args(["-c", "a.cpp"])
                    .working_directory(tmp.path())
                    .prerequisite(item("a.cpp"))
                    .produces(item("a.o"))
                    .dependency_list_file(Some(item("a.d")))
                    .build(),
                None,
            ),
        ];
        link(&mut actions).unwrap();

        let mut environment = BTreeMap::new();
        environment.insert("PATH".to_string(), "/usr/bin".to_string());
        let file = tmp.path().join("actions.json");
        export_json(&file, &actions, &[0, 1], &environment).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&file).unwrap()).unwrap();
        assert_eq!(json["Actions"][1]["Type"], "Compile");
        assert_eq!(json["Actions"][0]["Dependencies"][0], 1);

        let fresh = FileItemRegistry::new();
        let imported = import_json(&file, &fresh).unwrap();
        assert_eq!(imported.environment, environment);
        assert_eq!(imported.actions.len(), 2);
        for (original, restored) in actions.iter().zip(&imported.actions) {
            assert_eq!(original.command_line(), restored.command_line());
            assert_eq!(original.action_type(), restored.action_type());
            let paths = |a: &LinkedAction| -> (BTreeSet<PathBuf>, BTreeSet<PathBuf>) {
                (
                    a.prerequisite_items().iter().map(|i| i.location().to_path_buf()).collect(),
                    a.produced_items().iter().map(|i| i.location().to_path_buf()).collect(),
                )
            };
            assert_eq!(paths(original), paths(restored));
            assert_eq!(original.prerequisite_actions, restored.prerequisite_actions);
        }
        assert_eq!(
            imported.actions[1].dependency_list_file().map(|i| i.location().to_path_buf()),
            Some(tmp.path().join("a.d"))
        );
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("bad.json");
        std::fs::write(
            &file,
            r#"{ "Actions": [ { "Id": 0, "Type": "Compile", "CommandPath": "cc",
                "CommandArguments": [], "WorkingDirectory": "/",
                "PrerequisiteItems": [], "ProducedItems": ["/tmp/x.o"],
                "Dependencies": [5] } ] }"#,
        )
        .unwrap();
        assert!(import_json(&file, &FileItemRegistry::new()).is_err());
    }
}
