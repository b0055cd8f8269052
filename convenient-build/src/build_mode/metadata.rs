//! Target receipts and module manifests written after a successful build
//!
//! Two configurations of one target may share an output directory, so both
//! files are written while holding that directory's metadata lock.

use crate::error::BuildResult;
use crate::file_item::FileItem;
use crate::lock::BuildLock;
use crate::makefile::TargetMakefile;
use crate::persist::atomic_write;
use crate::session::TOOL_VERSION;
use crate::target::TargetDescriptor;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// One file the build produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BuildProduct {
    /// Location
    pub path: PathBuf,
    /// Kind of file (`Executable`, `DynamicLibrary`, ...)
    #[serde(rename = "Type")]
    pub product_type: String,
}

impl BuildProduct {
    fn of(item: &FileItem) -> Self {
        let name = item.name().to_ascii_lowercase();
        let product_type = match item.location().extension().and_then(|e| e.to_str()) {
            _ if name.ends_with(".debug") || name.ends_with(".pdb") || name.ends_with(".dsym") => {
                "SymbolFile"
            }
            Some("so") | Some("dll") | Some("dylib") => "DynamicLibrary",
            Some("a") | Some("lib") => "StaticLibrary",
            Some("exe") | None => "Executable",
            Some(_) => "RequiredResource",
        };
        Self {
            path: item.location().to_path_buf(),
            product_type: product_type.to_string(),
        }
    }
}

/// Record of what a target build produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TargetReceipt {
    /// Target name
    pub target_name: String,
    /// Platform
    pub platform: String,
    /// Configuration
    pub configuration: String,
    /// Architecture
    pub architecture: String,
    /// Project descriptor, if any
    pub project: Option<PathBuf>,
    /// Tool version that built it
    pub version: String,
    /// RFC 3339 build time
    pub build_time: String,
    /// Produced files
    pub build_products: Vec<BuildProduct>,
    /// Module name to its output files
    pub modules: BTreeMap<String, Vec<PathBuf>>,
}

impl TargetReceipt {
    /// Read a receipt
    pub fn read(path: &Path) -> BuildResult<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }
}

/// Module name to binary file name, for the loader of a modular target
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModuleManifest {
    /// Identifies one consistent set of module binaries
    pub build_id: String,
    /// Module name to file name within the manifest's directory
    pub modules: BTreeMap<String, String>,
}

/// Default receipt location for a target
pub fn receipt_path(descriptor: &TargetDescriptor, makefile: &TargetMakefile, root: &Path) -> PathBuf {
    makefile.receipt_path.clone().unwrap_or_else(|| {
        root.join("Binaries")
            .join(descriptor.platform.as_str())
            .join(format!("{}.target", descriptor.group_name()))
    })
}

fn renamed(item: &Arc<FileItem>, renames: &HashMap<Arc<FileItem>, Arc<FileItem>>) -> Arc<FileItem> {
    renames.get(item).cloned().unwrap_or_else(|| Arc::clone(item))
}

fn build_id(modules: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (module, file) in modules {
        hasher.update(module.as_bytes());
        hasher.update(b"=");
        hasher.update(file.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())[..16].to_string()
}

/// Update the `.modules` manifest in `directory` with this build's binaries
fn write_module_manifest(
    directory: &Path,
    target_name: &str,
    modules: &BTreeMap<String, Vec<Arc<FileItem>>>,
) -> BuildResult<Option<PathBuf>> {
    let path = directory.join(format!("{target_name}.modules"));
    let mut manifest: ModuleManifest = std::fs::read_to_string(&path)
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok())
        .unwrap_or_default();

    let mut changed = false;
    for (module, items) in modules {
        for item in items.iter().filter(|item| item.location().parent() == Some(directory)) {
            if item.has_extension("so") || item.has_extension("dll") || item.has_extension("dylib") {
                let previous = manifest
                    .modules
                    .insert(module.clone(), item.name().to_string());
                changed |= previous.as_deref() != Some(item.name());
            }
        }
    }
    if manifest.modules.is_empty() {
        return Ok(None);
    }
    if !changed && path.exists() {
        debug!("Module manifest {} is unchanged", path.display());
        return Ok(Some(path));
    }
    manifest.build_id = build_id(&manifest.modules);
    atomic_write(&path, serde_json::to_string_pretty(&manifest)?.as_bytes())?;
    Ok(Some(path))
}

/// Write the target receipt and module manifests under the metadata lock
///
/// `renames` maps module outputs to the names they were written under (hot
/// reload). Returns the receipt path.
pub fn write_metadata(
    descriptor: &TargetDescriptor,
    makefile: &TargetMakefile,
    renames: &HashMap<Arc<FileItem>, Arc<FileItem>>,
    root: &Path,
) -> BuildResult<PathBuf> {
    let receipt = receipt_path(descriptor, makefile, root);
    let lock_dir = receipt.parent().unwrap_or(root).to_path_buf();
    let _lock = BuildLock::acquire(&lock_dir, "metadata")?;

    let modules: BTreeMap<String, Vec<Arc<FileItem>>> = makefile
        .module_to_output_items
        .iter()
        .map(|(module, items)| {
            (
                module.clone(),
                items.iter().map(|item| renamed(item, renames)).collect(),
            )
        })
        .collect();
    let outputs: Vec<Arc<FileItem>> = makefile
        .output_items
        .iter()
        .map(|item| renamed(item, renames))
        .collect();

    let contents = TargetReceipt {
        target_name: descriptor.name.clone(),
        platform: descriptor.platform.to_string(),
        configuration: descriptor.configuration.to_string(),
        architecture: descriptor.architecture().to_string(),
        project: descriptor.project_file.clone(),
        version: TOOL_VERSION.to_string(),
        build_time: chrono::Utc::now().to_rfc3339(),
        build_products: outputs.iter().map(|item| BuildProduct::of(item)).collect(),
        modules: modules
            .iter()
            .map(|(module, items)| {
                (
                    module.clone(),
                    items.iter().map(|item| item.location().to_path_buf()).collect(),
                )
            })
            .collect(),
    };
    atomic_write(&receipt, serde_json::to_string_pretty(&contents)?.as_bytes())?;

    let mut directories: Vec<PathBuf> = modules
        .values()
        .flatten()
        .filter_map(|item| item.location().parent().map(Path::to_path_buf))
        .collect();
    directories.sort();
    directories.dedup();
    for directory in directories {
        if let Some(manifest) = write_module_manifest(&directory, &descriptor.name, &modules)? {
            debug!("Wrote module manifest {}", manifest.display());
        }
    }

    info!("Wrote target receipt {}", receipt.display());
    Ok(receipt)
}
