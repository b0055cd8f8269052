//! Hot reload patching
//!
//! A running process keeps its loaded module binaries open, so a hot reload
//! build writes the modules under new names (`libGame-Core-0003.so`) and
//! every action that mentions the old names is rebuilt to use the new ones.
//! Live coding instead compiles object files only; an external patcher links
//! them using the manifest written here.

use crate::action::{Action, ActionType};
use crate::error::BuildResult;
use crate::file_item::{FileItem, FileItemRegistry};
use crate::linked_action::LinkedAction;
use crate::makefile::TargetMakefile;
use crate::persist::atomic_write;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const MAX_SUFFIX: u32 = 9999;

/// How a build interacts with a running instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HotReloadMode {
    /// Regular build
    #[default]
    Disabled,
    /// Triggered from an IDE while the editor is running
    FromIde,
    /// Triggered from inside the editor
    FromEditor,
    /// Compile only; an external patcher links into the running process
    LiveCoding,
}

impl HotReloadMode {
    /// Whether any hot reload handling applies
    pub fn is_enabled(self) -> bool {
        self != Self::Disabled
    }

    /// Whether module binaries are written under suffixed names
    pub fn renames_outputs(self) -> bool {
        matches!(self, Self::FromIde | Self::FromEditor)
    }
}

/// Modules that take part in hot reload
///
/// Uses the makefile's explicit list; otherwise every module whose outputs
/// live outside the engine directory.
pub fn hot_reload_modules(makefile: &TargetMakefile, engine_dir: &Path) -> BTreeSet<String> {
    if !makefile.hot_reload_module_names.is_empty() {
        return makefile.hot_reload_module_names.clone();
    }
    makefile
        .module_to_output_items
        .iter()
        .filter(|(_, items)| items.iter().all(|item| !item.is_under(engine_dir)))
        .map(|(module, _)| module.clone())
        .collect()
}

/// Insert `-NNNN` before the first extension of the file name
pub fn suffixed_path(path: &Path, suffix: u32) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let renamed = match name.find('.') {
        Some(dot) if dot > 0 => format!("{}-{:04}{}", &name[..dot], suffix, &name[dot..]),
        _ => format!("{name}-{suffix:04}"),
    };
    path.with_file_name(renamed)
}

/// Smallest suffix for which none of the renamed files exist yet
pub fn unique_suffix(items: &[Arc<FileItem>]) -> u32 {
    (1..=MAX_SUFFIX)
        .find(|&suffix| {
            items
                .iter()
                .all(|item| !suffixed_path(item.location(), suffix).exists())
        })
        .unwrap_or(MAX_SUFFIX)
}

/// Replace `old` in `argument` where it appears as a whole file name
fn replace_file_name(argument: &str, old: &str, new: &str) -> String {
    let is_boundary_before = |c: char| matches!(c, '/' | '\\' | '=' | ',' | ':' | '"' | '\'');
    let is_name_char = |c: char| c.is_alphanumeric() || matches!(c, '_' | '-' | '.');

    let mut result = String::with_capacity(argument.len());
    let mut rest = argument;
    while let Some(position) = rest.find(old) {
        let before = rest[..position].chars().next_back();
        let after = rest[position + old.len()..].chars().next();
        let bounded = before.is_none_or(is_boundary_before) && after.is_none_or(|c| !is_name_char(c));
        result.push_str(&rest[..position]);
        result.push_str(if bounded { new } else { old });
        rest = &rest[position + old.len()..];
    }
    result.push_str(rest);
    result
}

/// Rebuild `action` with renamed items and arguments, if anything changes
fn rewrite_action(
    action: &Action,
    renames: &HashMap<Arc<FileItem>, Arc<FileItem>>,
) -> Option<Action> {
    let rename_items = |items: &[Arc<FileItem>]| -> (Vec<Arc<FileItem>>, bool) {
        let mut changed = false;
        let renamed = items
            .iter()
            .map(|item| match renames.get(item) {
                Some(new) => {
                    changed = true;
                    Arc::clone(new)
                }
                None => Arc::clone(item),
            })
            .collect();
        (renamed, changed)
    };
    let (produced, produced_changed) = rename_items(action.produced_items());
    let (prerequisites, prerequisites_changed) = rename_items(action.prerequisite_items());

    let mut arguments_changed = false;
    let arguments: Vec<String> = action
        .command_arguments()
        .iter()
        .map(|argument| {
            let mut rewritten = argument.clone();
            for (old, new) in renames {
                let old_path = old.location().to_string_lossy();
                if rewritten.contains(old_path.as_ref()) {
                    rewritten = rewritten.replace(old_path.as_ref(), &new.location().to_string_lossy());
                } else if rewritten.contains(old.name()) {
                    rewritten = replace_file_name(&rewritten, old.name(), new.name());
                }
            }
            arguments_changed |= rewritten != *argument;
            rewritten
        })
        .collect();

    if !(produced_changed || prerequisites_changed || arguments_changed) {
        return None;
    }
    Some(
        action
            .to_builder()
            .set_produced(produced)
            .set_prerequisites(prerequisites)
            .set_args(arguments)
            .build(),
    )
}

/// Rename the binaries producing `module_items` and patch every action
///
/// Every produced item of an action that writes a module binary is renamed
/// with the same suffix. Returns the rename map; the caller must re-link.
pub fn apply_hot_reload_suffix(
    actions: &mut [LinkedAction],
    module_items: &[Arc<FileItem>],
    registry: &FileItemRegistry,
) -> BuildResult<HashMap<Arc<FileItem>, Arc<FileItem>>> {
    let module_set: HashSet<&Arc<FileItem>> = module_items.iter().collect();
    let to_rename: Vec<Arc<FileItem>> = actions
        .iter()
        .filter(|action| action.produced_items().iter().any(|item| module_set.contains(item)))
        .flat_map(|action| action.produced_items().iter().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if to_rename.is_empty() {
        return Ok(HashMap::new());
    }

    let suffix = unique_suffix(&to_rename);
    let renames: HashMap<Arc<FileItem>, Arc<FileItem>> = to_rename
        .iter()
        .map(|item| {
            (
                Arc::clone(item),
                registry.get_item_by_path(suffixed_path(item.location(), suffix)),
            )
        })
        .collect();
    info!(
        "Hot reload: writing {} file(s) with suffix -{:04}",
        renames.len(),
        suffix
    );

    let mut patched = 0usize;
    for action in actions.iter_mut() {
        if let Some(rewritten) = rewrite_action(action.action(), &renames) {
            action.replace_inner(rewritten);
            patched += 1;
        }
    }
    debug!("Hot reload patched {} action(s)", patched);
    Ok(renames)
}

/// Linker invocation an external patcher repeats for one module
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LiveCodingModule {
    /// Module binary in the running process
    pub output: PathBuf,
    /// Object files the patcher links
    pub objects: Vec<PathBuf>,
    /// Linker arguments of the original link action
    pub link_arguments: Vec<String>,
}

/// What an external patcher needs to link compiled objects
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LiveCodingManifest {
    /// Linker executable
    pub linker_path: PathBuf,
    /// Environment the linker runs with
    pub linker_environment: BTreeMap<String, String>,
    /// One entry per hot-reloaded module binary
    pub modules: Vec<LiveCodingModule>,
}

/// Compile outputs to build under live coding, and the patcher manifest
///
/// The link actions producing `module_items` are not executed; their object
/// file prerequisites become the desired outputs instead.
pub fn live_coding_outputs(
    actions: &[LinkedAction],
    module_items: &[Arc<FileItem>],
    environment: &BTreeMap<String, String>,
) -> (Vec<Arc<FileItem>>, LiveCodingManifest) {
    let module_set: HashSet<&Arc<FileItem>> = module_items.iter().collect();
    let produced: HashSet<&Arc<FileItem>> = actions
        .iter()
        .flat_map(|action| action.produced_items())
        .collect();

    let mut objects = BTreeSet::new();
    let mut manifest = LiveCodingManifest {
        linker_path: PathBuf::new(),
        linker_environment: environment.clone(),
        modules: Vec::new(),
    };
    for action in actions.iter().filter(|action| action.action_type() == ActionType::Link) {
        let Some(output) = action
            .produced_items()
            .iter()
            .find(|item| module_set.contains(item))
        else {
            continue;
        };
        let inputs: Vec<Arc<FileItem>> = action
            .prerequisite_items()
            .iter()
            .filter(|item| produced.contains(item))
            .cloned()
            .collect();
        if manifest.linker_path.as_os_str().is_empty() {
            manifest.linker_path = action.command_path().to_path_buf();
        }
        manifest.modules.push(LiveCodingModule {
            output: output.location().to_path_buf(),
            objects: inputs.iter().map(|item| item.location().to_path_buf()).collect(),
            link_arguments: action.command_arguments().to_vec(),
        });
        objects.extend(inputs);
    }
    (objects.into_iter().collect(), manifest)
}

/// Manifest path next to a target receipt
pub fn live_coding_manifest_path(receipt: &Path) -> PathBuf {
    receipt.with_extension("livecoding.json")
}

/// Write the manifest as JSON
pub fn write_live_coding_manifest(path: &Path, manifest: &LiveCodingManifest) -> BuildResult<()> {
    atomic_write(path, serde_json::to_string_pretty(manifest)?.as_bytes())?;
    info!("Wrote live coding manifest {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_graph::link;
    use tempfile::TempDir;

    #[test]
    fn test_suffixed_path_keeps_all_extensions() {
        assert_eq!(
            suffixed_path(Path::new("/b/libGame-Core.so.debug"), 7),
            PathBuf::from("/b/libGame-Core-0007.so.debug")
        );
        assert_eq!(suffixed_path(Path::new("/b/Game"), 12), PathBuf::from("/b/Game-0012"));
    }

    #[test]
    fn test_unique_suffix_skips_existing_files() {
        let tmp = TempDir::new().unwrap();
        let registry = FileItemRegistry::new();
        let binary = registry.get_item_by_path(tmp.path().join("Game.so"));
        std::fs::write(tmp.path().join("Game-0001.so"), "").unwrap();
        assert_eq!(unique_suffix(&[binary]), 2);
    }

    #[test]
    fn test_replace_file_name_respects_boundaries() {
        assert_eq!(
            replace_file_name("-Wl,-soname,Game.so", "Game.so", "Game-0001.so"),
            "-Wl,-soname,Game-0001.so"
        );
        assert_eq!(replace_file_name("libGame.so", "Game.so", "X.so"), "libGame.so");
    }

    fn link_graph(registry: &FileItemRegistry, root: &Path) -> Vec<LinkedAction> {
        let object = registry.get_item_by_path(root.join("Game.o"));
        let binary = registry.get_item_by_path(root.join("Game.so"));
        let compile = Action::builder(ActionType::Compile)
            .command("cc")
            .args(["-c", "Game.cpp"])
            .prerequisite(registry.get_item_by_path(root.join("Game.cpp")))
            .produces(Arc::clone(&object))
            .build();
        let link_action = Action::builder(ActionType::Link)
            .command("ld")
            .arg("-shared")
            .arg(format!("-o{}", binary.location().display()))
            .arg("-Wl,-soname,Game.so")
            .prerequisite(object)
            .produces(binary)
            .build();
        let launcher = Action::builder(ActionType::PostBuildStep)
            .command("stage")
            .arg(root.join("Game.so").display().to_string())
            .prerequisite(registry.get_item_by_path(root.join("Game.so")))
            .produces(registry.get_item_by_path(root.join("Staged.txt")))
            .build();
        let mut actions = vec![
            LinkedAction::new(compile, None),
            LinkedAction::new(link_action, None),
            LinkedAction::new(launcher, None),
        ];
        link(&mut actions).unwrap();
        actions
    }

    #[test]
    fn test_suffix_rewrites_producer_and_consumers() {
        let tmp = TempDir::new().unwrap();
        let registry = FileItemRegistry::new();
        let mut actions = link_graph(&registry, tmp.path());
        let binary = registry.get_item_by_path(tmp.path().join("Game.so"));

        let renames = apply_hot_reload_suffix(&mut actions, &[Arc::clone(&binary)], &registry).unwrap();
        let renamed = &renames[&binary];
        assert_eq!(renamed.name(), "Game-0001.so");

        link(&mut actions).unwrap();
        assert!(Arc::ptr_eq(&actions[1].produced_items()[0], renamed));
        assert!(actions[1].command_arguments().iter().any(|a| a == "-Wl,-soname,Game-0001.so"));
        assert!(Arc::ptr_eq(&actions[2].prerequisite_items()[0], renamed));
        assert!(actions[2].command_arguments()[0].ends_with("Game-0001.so"));
        assert!(actions[2].prerequisite_actions.contains(&1));
        // The compile action does not mention the binary
        assert_eq!(actions[0].command_arguments(), ["-c", "Game.cpp"]);
    }

    #[test]
    fn test_live_coding_builds_objects_only() {
        let tmp = TempDir::new().unwrap();
        let registry = FileItemRegistry::new();
        let actions = link_graph(&registry, tmp.path());
        let binary = registry.get_item_by_path(tmp.path().join("Game.so"));

        let (objects, manifest) = live_coding_outputs(&actions, &[binary], &BTreeMap::new());
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].name(), "Game.o");
        assert_eq!(manifest.linker_path, PathBuf::from("ld"));
        assert_eq!(manifest.modules[0].objects, vec![tmp.path().join("Game.o")]);
        assert_eq!(
            live_coding_manifest_path(Path::new("/b/Game-Linux-Development.target")),
            PathBuf::from("/b/Game-Linux-Development.livecoding.json")
        );
    }
}
