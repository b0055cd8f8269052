//! Target builder reading action lists from JSON manifests
//!
//! A manifest lives at `<root>/Targets/<Name>.target.json` under the project
//! or engine directory. Before parsing, `$(Platform)`, `$(Configuration)`,
//! `$(Architecture)`, `$(Target)`, `$(ProjectDir)` and `$(EngineDir)` are
//! substituted. Relative paths are resolved against the manifest's root.

use crate::action::SerializedAction;
use crate::cache::SourceFileMetadataCache;
use crate::config::BuildConfiguration;
use crate::error::{BuildError, BuildResult};
use crate::file_item::FileItem;
use crate::makefile::TargetMakefile;
use crate::session::{BuildSession, TOOL_VERSION};
use crate::target::{TargetBuilder, TargetDescriptor};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use walkdir::WalkDir;

const SOURCE_EXTENSIONS: [&str; 10] = ["h", "hpp", "inl", "c", "cc", "cpp", "cxx", "ixx", "cppm", "m"];
const COMPILED_EXTENSIONS: [&str; 6] = ["c", "cc", "cpp", "cxx", "ixx", "cppm"];

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct TargetManifest {
    actions: Vec<SerializedAction>,
    modules: BTreeMap<String, Vec<PathBuf>>,
    output_items: Vec<PathBuf>,
    pre_build_scripts: Vec<PathBuf>,
    post_build_scripts: Vec<PathBuf>,
    source_directories: Vec<PathBuf>,
    hot_reload_modules: BTreeSet<String>,
    #[serde(rename = "MemoryPerActionGB")]
    memory_per_action_gb: f64,
    diagnostics: Vec<String>,
    receipt_path: Option<PathBuf>,
}

/// [`TargetBuilder`] backed by `Targets/<Name>.target.json` files
#[derive(Debug, Default, Clone, Copy)]
pub struct ManifestTargetBuilder;

impl ManifestTargetBuilder {
    /// Manifest locations tried for `descriptor`, most specific first
    pub fn candidates(descriptor: &TargetDescriptor, session: &BuildSession) -> Vec<PathBuf> {
        let file = format!("{}.target.json", descriptor.name);
        let mut roots: Vec<PathBuf> = Vec::new();
        if let Some(project) = descriptor.project_file.as_deref().and_then(Path::parent) {
            roots.push(project.to_path_buf());
        }
        roots.extend(session.project_dir().map(Path::to_path_buf));
        roots.push(session.engine_dir().to_path_buf());
        roots.dedup();
        roots.into_iter().map(|root| root.join("Targets").join(&file)).collect()
    }
}

/// The `<Stem>.generated.h` include a reflected header must carry, if absent
fn missing_generated_include(
    header: &FileItem,
    metadata_cache: &SourceFileMetadataCache,
) -> Option<String> {
    if !has_any_extension(header.location(), &["h", "hpp"]) {
        return None;
    }
    let stem = header.location().file_stem()?.to_str()?;
    let expected = format!("{stem}.generated.h");
    let includes = metadata_cache.get_includes(header);
    let found = includes
        .iter()
        .any(|include| Path::new(include).file_name().is_some_and(|name| name == expected.as_str()));
    (!found).then_some(expected)
}

fn json_escaped(value: &str) -> String {
    let quoted = serde_json::Value::String(value.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

/// Replace `$(Name)` variables in manifest text
fn substitute(text: &str, variables: &BTreeMap<&str, String>) -> String {
    let mut result = text.to_string();
    for (name, value) in variables {
        result = result.replace(&format!("$({name})"), &json_escaped(value));
    }
    result
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

fn has_any_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
}

impl TargetBuilder for ManifestTargetBuilder {
    fn build_makefile(
        &self,
        descriptor: &TargetDescriptor,
        session: &BuildSession,
    ) -> BuildResult<TargetMakefile> {
        let candidates = Self::candidates(descriptor, session);
        let Some(location) = candidates.iter().find(|path| path.is_file()) else {
            return Err(BuildError::TargetFailed {
                target: descriptor.group_name(),
                reason: format!(
                    "no target manifest found (tried {})",
                    candidates
                        .iter()
                        .map(|path| path.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            });
        };
        let root = location
            .parent()
            .and_then(Path::parent)
            .unwrap_or(Path::new("/"))
            .to_path_buf();
        debug!("Reading target manifest {}", location.display());

        let variables = BTreeMap::from([
            ("Platform", descriptor.platform.to_string()),
            ("Configuration", descriptor.configuration.to_string()),
            ("Architecture", descriptor.architecture().to_string()),
            ("Target", descriptor.name.clone()),
            (
                "ProjectDir",
                session.project_dir().unwrap_or(root.as_path()).display().to_string(),
            ),
            ("EngineDir", session.engine_dir().display().to_string()),
        ]);
        let text = substitute(&std::fs::read_to_string(location)?, &variables);
        let manifest: TargetManifest = serde_json::from_str(&text)?;

        let registry = session.registry();
        let item = |path: &Path| registry.get_item_by_path(resolve(&root, path));
        let resolve_all = |paths: &[PathBuf]| -> Vec<PathBuf> {
            paths.iter().map(|path| resolve(&root, path)).collect()
        };

        let mut makefile = TargetMakefile::new(TOOL_VERSION);
        makefile.actions = manifest
            .actions
            .into_iter()
            .map(|mut action| {
                action.prerequisite_items = resolve_all(&action.prerequisite_items);
                action.produced_items = resolve_all(&action.produced_items);
                action.delete_items = resolve_all(&action.delete_items);
                for file in [
                    &mut action.dependency_list_file,
                    &mut action.module_dependencies_file,
                    &mut action.compiled_module_interface_file,
                ] {
                    if let Some(path) = file.take() {
                        *file = Some(resolve(&root, &path));
                    }
                }
                if action.working_directory.as_os_str().is_empty() {
                    action.working_directory = root.clone();
                } else {
                    action.working_directory = resolve(&root, &action.working_directory);
                }
                Arc::new(action.intern(registry))
            })
            .collect();
        makefile.module_to_output_items = manifest
            .modules
            .iter()
            .map(|(module, paths)| (module.clone(), paths.iter().map(|p| item(p)).collect()))
            .collect();
        makefile.output_items = manifest.output_items.iter().map(|p| item(p)).collect();
        makefile.pre_build_scripts = resolve_all(&manifest.pre_build_scripts);
        makefile.post_build_scripts = resolve_all(&manifest.post_build_scripts);
        makefile.environment = session.environment().clone();
        makefile.diagnostics = manifest.diagnostics;
        makefile.memory_per_action_gb = manifest.memory_per_action_gb;
        makefile.hot_reload_module_names = manifest.hot_reload_modules;
        makefile.receipt_path = manifest.receipt_path.map(|path| resolve(&root, &path));

        let mut directories = Vec::new();
        let mut sources = Vec::new();
        for directory in &manifest.source_directories {
            let directory = resolve(&root, directory);
            for entry in WalkDir::new(&directory).into_iter().filter_map(Result::ok) {
                if entry.file_type().is_dir() {
                    directories.push(registry.get_item_by_path(entry.path()));
                } else if has_any_extension(entry.path(), &SOURCE_EXTENSIONS) {
                    sources.push(registry.get_item_by_path(entry.path()));
                }
            }
        }
        let metadata_cache = session.metadata_cache();
        metadata_cache.prefetch(&sources);
        for directory in &directories {
            makefile.add_source_directory(directory);
        }
        for source in &sources {
            let has_markup = metadata_cache.contains_reflection_markup(source);
            if has_markup && let Some(expected) = missing_generated_include(source, metadata_cache) {
                makefile.diagnostics.push(format!(
                    "{} declares reflected types but does not include \"{}\"",
                    source.location().display(),
                    expected
                ));
            }
            makefile.add_source_file(source, has_markup);
            if has_any_extension(source.location(), &COMPILED_EXTENSIONS) {
                let _ = makefile
                    .candidate_working_set_files
                    .insert(source.location().to_path_buf());
            }
        }

        let manifest_item = registry.get_item_by_path(location);
        makefile.add_config_dependency(&manifest_item, metadata_cache.get_content_hash(&manifest_item));
        for config in BuildConfiguration::search_paths(session.engine_dir(), session.project_dir(), None) {
            if config.exists() {
                let config_item = registry.get_item_by_path(&config);
                makefile.add_config_dependency(&config_item, metadata_cache.get_content_hash(&config_item));
            }
        }

        debug!(
            "Target {} has {} action(s), {} source file(s)",
            descriptor.group_name(),
            makefile.actions.len(),
            makefile.source_files.len()
        );
        Ok(makefile)
    }
}
