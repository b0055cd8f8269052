//! C++ module interface resolution
//!
//! Module imports are only known after the dependency scanners ran, so the
//! scan actions execute first. Their output maps every imported module name
//! to the compiled interface that provides it; importing actions are rebuilt
//! with the interface as an extra prerequisite and a reference argument, and
//! the graph is re-linked before the main outdated pass.
//!
//! When a scan has not produced output yet, the module declarations are read
//! from the translation unit itself through the source metadata cache.

use crate::action::{Action, ActionType};
use crate::action_graph::{
    OutdatedActionMap, create_directories_for_produced_items, delete_outdated_produced_items,
    gather_prerequisite_actions, get_outdated_actions, link,
};
use crate::error::{BuildError, BuildResult};
use crate::executor::ActionExecutor;
use crate::file_item::FileItem;
use crate::linked_action::LinkedAction;
use crate::session::BuildSession;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const MODULE_SOURCE_EXTENSIONS: [&str; 6] = ["ixx", "cppm", "cpp", "cc", "cxx", "c++"];

/// Translation unit an action compiles
fn primary_source(action: &LinkedAction) -> Option<&Arc<FileItem>> {
    action.prerequisite_items().iter().find(|item| {
        MODULE_SOURCE_EXTENSIONS
            .iter()
            .any(|extension| item.has_extension(extension))
    })
}

fn produced_module(action: &LinkedAction, scan: &FileItem, session: &BuildSession) -> Option<String> {
    session
        .dependency_cache()
        .try_get_produced_module(scan)
        .or_else(|| {
            let source = primary_source(action)?;
            session.metadata_cache().get_exported_module(source)
        })
}

fn imported_modules(action: &LinkedAction, scan: &FileItem, session: &BuildSession) -> Option<Vec<String>> {
    session
        .dependency_cache()
        .try_get_imported_modules(scan)
        .or_else(|| {
            let source = primary_source(action).filter(|source| source.exists())?;
            Some(session.metadata_cache().get_imported_modules(source))
        })
}

/// Argument telling the compiler where a module's interface lives
pub fn module_reference_argument(action: &Action, module: &str, interface: &FileItem) -> String {
    let is_msvc = action
        .command_path()
        .file_stem()
        .is_some_and(|stem| stem.eq_ignore_ascii_case("cl"));
    if is_msvc {
        format!("/reference {}={}", module, interface.location().display())
    } else {
        format!("-fmodule-file={}={}", module, interface.location().display())
    }
}

/// Run outdated module scans, if an executor is given
async fn run_module_scans(
    actions: &[LinkedAction],
    session: &BuildSession,
    executor: &dyn ActionExecutor,
) -> BuildResult<()> {
    let scan_outputs: Vec<Arc<FileItem>> = actions
        .iter()
        .filter(|action| action.action_type() == ActionType::GatherModuleDependencies)
        .flat_map(|action| action.produced_items().iter().cloned())
        .collect();
    if scan_outputs.is_empty() {
        return Ok(());
    }

    let subset = gather_prerequisite_actions(actions, &scan_outputs);
    let map = OutdatedActionMap::new();
    let outdated = get_outdated_actions(actions, &subset, &session.outdated_context(), &map)?;
    if outdated.is_empty() {
        debug!("Module dependency scans are up to date");
        return Ok(());
    }

    info!("Scanning module dependencies ({} actions)", outdated.len());
    delete_outdated_produced_items(actions, &outdated, session.history())?;
    create_directories_for_produced_items(actions, &outdated)?;
    let summary = executor
        .execute(actions, &outdated, session.history())
        .await?;
    let _ = summary.into_result()?;
    Ok(())
}

/// Map module names to the interface files compiled for them
fn interface_files(actions: &[LinkedAction], session: &BuildSession) -> HashMap<String, Arc<FileItem>> {
    let mut interfaces: HashMap<String, Arc<FileItem>> = HashMap::new();
    for action in actions {
        let (Some(interface), Some(scan)) = (
            action.compiled_module_interface_file(),
            action.module_dependencies_file(),
        ) else {
            continue;
        };
        let Some(module) = produced_module(action, scan, session) else {
            continue;
        };
        match interfaces.get(&module) {
            Some(existing) if existing != interface => warn!(
                "Module '{}' is provided by both {} and {}; using the former",
                module,
                existing.location().display(),
                interface.location().display()
            ),
            Some(_) => {}
            None => {
                let _ = interfaces.insert(module, Arc::clone(interface));
            }
        }
    }
    interfaces
}

/// Resolve module imports into interface prerequisites and re-link
///
/// With an executor, outdated scan actions run first. Without one, only
/// scans already on disk are used. Returns the number of patched actions.
pub async fn patch_module_interfaces(
    actions: &mut [LinkedAction],
    session: &BuildSession,
    executor: Option<&dyn ActionExecutor>,
) -> BuildResult<usize> {
    if !actions.iter().any(|action| action.module_dependencies_file().is_some()) {
        return Ok(0);
    }
    if let Some(executor) = executor {
        run_module_scans(actions, session, executor).await?;
    }

    let interfaces = interface_files(actions, session);
    let mut patched = 0usize;
    for action in actions.iter_mut() {
        let Some(scan) = action.module_dependencies_file() else {
            continue;
        };
        let Some(imports) = imported_modules(action, scan, session) else {
            debug!("No module scan or source for {}", action.description());
            continue;
        };
        if imports.is_empty() {
            continue;
        }

        let mut builder = action.to_builder();
        let mut changed = false;
        for module in &imports {
            let interface = interfaces.get(module).ok_or_else(|| BuildError::ModuleNotFound {
                module: module.clone(),
                importer: action.description(),
            })?;
            if action.produced_items().contains(interface) {
                continue;
            }
            if !action.prerequisite_items().contains(interface) {
                builder = builder.prerequisite(Arc::clone(interface));
                changed = true;
            }
            let reference = module_reference_argument(action, module, interface);
            if !action.command_arguments().contains(&reference) {
                builder = builder.arg(reference);
                changed = true;
            }
        }
        if changed {
            action.replace_inner(builder.build());
            patched += 1;
        }
    }

    if patched > 0 {
        info!("Resolved module imports for {} action(s)", patched);
        link(actions)?;
    }
    Ok(patched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfiguration;
    use std::path::Path;
    use tempfile::TempDir;

    fn scan_json(provides: Option<&str>, requires: &[&str]) -> String {
        let provides: Vec<serde_json::Value> = provides
            .map(|name| serde_json::json!({ "logical-name": name }))
            .into_iter()
            .collect();
        let requires: Vec<serde_json::Value> = requires
            .iter()
            .map(|name| serde_json::json!({ "logical-name": name }))
            .collect();
        serde_json::json!({
            "version": 1,
            "rules": [{ "provides": provides, "requires": requires }]
        })
        .to_string()
    }

    /// Scan + interface compile for Core.ixx, scan + compile for Game.cpp
    fn module_graph(session: &BuildSession, root: &Path, scan_command: Option<[&str; 2]>) -> Vec<LinkedAction> {
        let registry = session.registry();
        let item = |name: &str| registry.get_item_by_path(root.join(name));
        let scan = |source: &str, output: &str, json: String| {
            let builder = Action::builder(ActionType::GatherModuleDependencies)
                .prerequisite(item(source))
                .produces(item(output));
            let builder = match scan_command {
                Some([shell, flag]) => builder.command(shell).arg(flag).arg(format!(
                    "printf '%s' '{}' > {}",
                    json,
                    root.join(output).display()
                )),
                None => builder.command("scan-deps").arg(source),
            };
            builder.build()
        };

        let actions = vec![
            scan("Core.ixx", "Core.ixx.json", scan_json(Some("Core"), &[])),
            scan("Game.cpp", "Game.cpp.json", scan_json(None, &["Core"])),
            Action::builder(ActionType::CompileModuleInterface)
                .command("clang++")
                .args(["--precompile", "Core.ixx"])
                .prerequisite(item("Core.ixx"))
                .prerequisite(item("Core.ixx.json"))
                .produces(item("Core.pcm"))
                .module_dependencies_file(Some(item("Core.ixx.json")))
                .compiled_module_interface_file(Some(item("Core.pcm")))
                .build(),
            Action::builder(ActionType::Compile)
                .command("clang++")
                .args(["-c", "Game.cpp"])
                .prerequisite(item("Game.cpp"))
                .prerequisite(item("Game.cpp.json"))
                .produces(item("Game.o"))
                .module_dependencies_file(Some(item("Game.cpp.json")))
                .build(),
        ];
        let mut linked: Vec<LinkedAction> = actions
            .into_iter()
            .map(|action| LinkedAction::new(action, None))
            .collect();
        link(&mut linked).unwrap();
        linked
    }

    #[tokio::test]
    async fn test_existing_scans_add_interface_prerequisite() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("Core.ixx.json"), scan_json(Some("Core"), &[])).unwrap();
        std::fs::write(tmp.path().join("Game.cpp.json"), scan_json(None, &["Core"])).unwrap();
        let session = BuildSession::in_memory(tmp.path(), BuildConfiguration::default());
        let mut actions = module_graph(&session, tmp.path(), None);

        let patched = patch_module_interfaces(&mut actions, &session, None).await.unwrap();
        assert_eq!(patched, 1);
        let game = &actions[3];
        assert!(game.prerequisite_actions.contains(&2));
        let expected = format!("-fmodule-file=Core={}", tmp.path().join("Core.pcm").display());
        assert!(game.command_arguments().contains(&expected));

        // A second pass finds nothing left to patch
        assert_eq!(patch_module_interfaces(&mut actions, &session, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sources_stand_in_for_missing_scans() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("Core.ixx"), "export module Core;\nexport int answer();\n").unwrap();
        std::fs::write(tmp.path().join("Game.cpp"), "// entry point\nimport Core;\nint main() {}\n").unwrap();
        let session = BuildSession::in_memory(tmp.path(), BuildConfiguration::default());
        let mut actions = module_graph(&session, tmp.path(), None);

        let patched = patch_module_interfaces(&mut actions, &session, None).await.unwrap();
        assert_eq!(patched, 1);
        assert!(actions[3].prerequisite_actions.contains(&2));
        assert!(!tmp.path().join("Game.cpp.json").exists());
    }

    #[tokio::test]
    async fn test_unknown_import_is_an_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("Core.ixx.json"), scan_json(Some("Core"), &[])).unwrap();
        std::fs::write(tmp.path().join("Game.cpp.json"), scan_json(None, &["Physics"])).unwrap();
        let session = BuildSession::in_memory(tmp.path(), BuildConfiguration::default());
        let mut actions = module_graph(&session, tmp.path(), None);

        let error = patch_module_interfaces(&mut actions, &session, None)
            .await
            .unwrap_err();
        assert!(matches!(error, BuildError::ModuleNotFound { ref module, .. } if module == "Physics"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scans_run_before_patching() {
        use crate::executor::ParallelExecutor;

        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("Core.ixx"), "export module Core;").unwrap();
        std::fs::write(tmp.path().join("Game.cpp"), "import Core;").unwrap();
        let session = BuildSession::in_memory(tmp.path(), BuildConfiguration::default());
        let mut actions = module_graph(&session, tmp.path(), Some(["/bin/sh", "-c"]));

        let executor = ParallelExecutor::new(2);
        let patched = patch_module_interfaces(&mut actions, &session, Some(&executor))
            .await
            .unwrap();
        assert_eq!(patched, 1);
        assert!(tmp.path().join("Game.cpp.json").exists());
        assert!(actions[3].prerequisite_actions.contains(&2));
    }

    #[test]
    fn test_msvc_uses_reference_flag() {
        let registry = crate::file_item::FileItemRegistry::new();
        let action = Action::builder(ActionType::Compile).command("C:/VC/bin/cl.exe").build();
        let interface = registry.get_item_by_path("/i/Core.ifc");
        assert_eq!(
            module_reference_argument(&action, "Core", &interface),
            "/reference Core=/i/Core.ifc"
        );
    }
}
