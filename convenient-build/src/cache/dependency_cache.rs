//! Cache of parsed compiler dependency lists
//!
//! Understands three formats, chosen by content:
//! - Makefile-style `.d` files (`-MD`), with `\` continuations and escaped spaces
//! - MSVC `/sourceDependencies` JSON (`Data.Includes`, `Data.ImportedModules`,
//!   `Data.ProvidedModule`)
//! - P1689 module scan JSON (`rules[].provides[]` / `rules[].requires[]`)
//!
//! Entries are stored as written. Compilers write relative entries against
//! their working directory, so they are resolved against the consuming
//! action's working directory on lookup.

use super::CacheHierarchy;
use crate::error::BuildResult;
use crate::file_item::{FileItem, FileItemRegistry};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const DEPENDENCY_CACHE_VERSION: u32 = 3;

/// File name of a persisted dependency cache layer
pub const DEPENDENCY_CACHE_FILE: &str = "CppDependencies.bin";

/// Everything extracted from one dependency list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyInfo {
    /// Files the compilation read, as written in the list
    pub includes: Vec<PathBuf>,

    /// Named modules the translation unit imports
    pub imported_modules: Vec<String>,

    /// Named module the translation unit exports, if any
    pub produced_module: Option<String>,
}

/// Hierarchical cache of [`DependencyInfo`] keyed by dependency-list file
pub struct CppDependencyCache {
    hierarchy: CacheHierarchy<DependencyInfo>,
}

impl CppDependencyCache {
    /// Load one layer per `(base_dir, cache file)` pair
    pub fn create_hierarchy(bases: impl IntoIterator<Item = (PathBuf, PathBuf)>) -> Self {
        Self {
            hierarchy: CacheHierarchy::load(bases, DEPENDENCY_CACHE_VERSION),
        }
    }

    /// Unpersisted cache
    pub fn in_memory() -> Self {
        Self {
            hierarchy: CacheHierarchy::new(Vec::new()),
        }
    }

    fn info(&self, item: &FileItem) -> Option<DependencyInfo> {
        self.hierarchy.get_or_compute(item, |path| {
            let content = match std::fs::read_to_string(path) {
                Ok(content) => content,
                Err(e) => {
                    debug!("Unable to read {}: {}", path.display(), e);
                    return None;
                }
            };
            let parsed = parse_dependency_list(&content);
            if parsed.is_none() {
                debug!("Unable to parse dependency list {}", path.display());
            }
            parsed
        })
    }

    /// Files listed in the dependency list, or `None` if it is missing or unparseable
    ///
    /// Relative entries are resolved against `working_directory`, the
    /// directory the compiler ran in.
    pub fn try_get_dependencies(
        &self,
        item: &FileItem,
        working_directory: &Path,
        registry: &FileItemRegistry,
    ) -> Option<Vec<Arc<FileItem>>> {
        self.info(item).map(|info| {
            info.includes
                .iter()
                .map(|path| registry.get_item_by_path(resolve(path, working_directory)))
                .collect()
        })
    }

    /// Module exported by the scanned translation unit
    pub fn try_get_produced_module(&self, item: &FileItem) -> Option<String> {
        self.info(item).and_then(|info| info.produced_module)
    }

    /// Modules imported by the scanned translation unit
    pub fn try_get_imported_modules(&self, item: &FileItem) -> Option<Vec<String>> {
        self.info(item).map(|info| info.imported_modules)
    }

    /// Parse many dependency lists in parallel ahead of the outdated pass
    pub fn prefetch(&self, items: &[Arc<FileItem>]) {
        items.par_iter().for_each(|item| {
            let _ = self.info(item);
        });
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.hierarchy.len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.hierarchy.is_empty()
    }

    /// Persist modified layers
    pub fn save_all(&self) -> BuildResult<()> {
        self.hierarchy.save_all()
    }
}

/// Parse a dependency list in any supported format
pub fn parse_dependency_list(content: &str) -> Option<DependencyInfo> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('{') {
        let value: Value = serde_json::from_str(trimmed).ok()?;
        if value.get("Data").is_some() {
            parse_msvc_json(&value)
        } else if value.get("rules").is_some() {
            parse_p1689(&value)
        } else {
            None
        }
    } else {
        parse_makefile_dependencies(content)
    }
}

fn has_drive_prefix(path: &Path) -> bool {
    let bytes = path.as_os_str().as_encoded_bytes();
    bytes.len() > 2
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && matches!(bytes[2], b'/' | b'\\')
}

/// Resolve a dependency-list entry written relative to `working_directory`
fn resolve(path: &Path, working_directory: &Path) -> PathBuf {
    if path.is_absolute() || has_drive_prefix(path) {
        path.to_path_buf()
    } else {
        working_directory.join(path)
    }
}

fn parse_msvc_json(value: &Value) -> Option<DependencyInfo> {
    let data = value.get("Data")?;
    let mut includes: Vec<PathBuf> = data
        .get("Includes")
        .and_then(Value::as_array)
        .map(|includes| {
            includes
                .iter()
                .filter_map(Value::as_str)
                .map(PathBuf::from)
                .collect()
        })
        .unwrap_or_default();

    let mut imported_modules = Vec::new();
    if let Some(modules) = data.get("ImportedModules").and_then(Value::as_array) {
        for module in modules {
            match module {
                Value::String(name) => imported_modules.push(name.clone()),
                Value::Object(entry) => {
                    if let Some(name) = entry.get("Name").and_then(Value::as_str) {
                        imported_modules.push(name.to_string());
                    }
                    if let Some(bmi) = entry.get("BMI").and_then(Value::as_str) {
                        includes.push(PathBuf::from(bmi));
                    }
                }
                _ => {}
            }
        }
    }

    let produced_module = data
        .get("ProvidedModule")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .map(str::to_string);

    Some(DependencyInfo {
        includes,
        imported_modules,
        produced_module,
    })
}

fn parse_p1689(value: &Value) -> Option<DependencyInfo> {
    let rules = value.get("rules")?.as_array()?;
    let logical_names = |rule: &Value, key: &str| -> Vec<String> {
        rule.get(key)
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| entry.get("logical-name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };

    let mut info = DependencyInfo::default();
    for rule in rules {
        if info.produced_module.is_none() {
            info.produced_module = logical_names(rule, "provides").into_iter().next();
        }
        info.imported_modules.extend(logical_names(rule, "requires"));
    }
    Some(info)
}

fn parse_makefile_dependencies(content: &str) -> Option<DependencyInfo> {
    // Join continuation lines
    let joined = content.replace("\\\r\n", " ").replace("\\\n", " ");
    let rule = joined.lines().find(|line| !line.trim().is_empty())?;
    let separator = find_rule_separator(rule)?;

    let includes = split_makefile_words(&rule[separator + 1..])
        .into_iter()
        .map(PathBuf::from)
        .collect();
    Some(DependencyInfo {
        includes,
        ..DependencyInfo::default()
    })
}

// The target/prerequisite separator is the first ':' not part of a drive
// letter (`C:\`) and not escaped.
fn find_rule_separator(rule: &str) -> Option<usize> {
    let bytes = rule.as_bytes();
    for (index, &byte) in bytes.iter().enumerate() {
        if byte != b':' {
            continue;
        }
        if index > 0 && bytes[index - 1] == b'\\' {
            continue;
        }
        let drive_start = index == 1 || (index >= 2 && bytes[index - 2].is_ascii_whitespace());
        let next = bytes.get(index + 1).copied();
        if drive_start && matches!(next, Some(b'\\') | Some(b'/')) {
            continue;
        }
        return Some(index);
    }
    None
}

fn split_makefile_words(text: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&' ') => {
                current.push(' ');
                let _ = chars.next();
            }
            '$' if chars.peek() == Some(&'$') => {
                current.push('$');
                let _ = chars.next();
            }
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}
