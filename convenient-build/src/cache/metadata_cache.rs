//! Cache of facts scanned out of source files
//!
//! For every source or header the cache records its `#include` directives,
//! C++ module imports and exports, whether it carries reflection markup, and
//! a content fingerprint.

use super::CacheHierarchy;
use crate::error::BuildResult;
use crate::file_item::{ContentHash, FileItem};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

const METADATA_CACHE_VERSION: u32 = 2;

/// File name of a persisted metadata cache layer
pub const METADATA_CACHE_FILE: &str = "SourceFileMetadata.bin";

const REFLECTION_MARKERS: [&str; 5] = ["UCLASS(", "USTRUCT(", "UENUM(", "UINTERFACE(", "UDELEGATE("];

/// Facts extracted from one source file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFileMetadata {
    /// Include targets as written (`Foo/Bar.h`), in order of appearance
    pub includes: Vec<String>,

    /// Named modules imported with `import X;`
    pub imported_modules: Vec<String>,

    /// Module declared with `export module X;`
    pub exported_module: Option<String>,

    /// Whether the file declares reflected types
    pub has_reflection_markup: bool,

    /// Content fingerprint
    pub content_hash: ContentHash,
}

impl SourceFileMetadata {
    /// Scan source text
    pub fn scan(content: &str) -> Self {
        let mut metadata = Self {
            includes: Vec::new(),
            imported_modules: Vec::new(),
            exported_module: None,
            has_reflection_markup: false,
            content_hash: ContentHash::from_bytes(content.as_bytes()),
        };

        let mut in_block_comment = false;
        for raw_line in content.lines() {
            let line = strip_comments(raw_line, &mut in_block_comment);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(directive) = line.strip_prefix('#') {
                if let Some(target) = parse_include(directive.trim_start()) {
                    metadata.includes.push(target);
                }
                continue;
            }

            if let Some(rest) = line.strip_prefix("export module ") {
                metadata.exported_module = module_name(rest);
                continue;
            }

            let import = line
                .strip_prefix("export import ")
                .or_else(|| line.strip_prefix("import "));
            if let Some(rest) = import {
                // Header units (`import <vector>;`) are not named modules
                if !rest.starts_with('<') && !rest.starts_with('"') {
                    if let Some(name) = module_name(rest) {
                        metadata.imported_modules.push(name);
                    }
                }
                continue;
            }

            if !metadata.has_reflection_markup
                && REFLECTION_MARKERS.iter().any(|marker| line.starts_with(marker))
            {
                metadata.has_reflection_markup = true;
            }
        }
        metadata
    }
}

fn strip_comments(line: &str, in_block_comment: &mut bool) -> String {
    let mut result = String::with_capacity(line.len());
    let mut rest = line;
    loop {
        if *in_block_comment {
            match rest.find("*/") {
                Some(end) => {
                    *in_block_comment = false;
                    rest = &rest[end + 2..];
                }
                None => return result,
            }
        }
        let line_comment = rest.find("//");
        let block_comment = rest.find("/*");
        match (line_comment, block_comment) {
            (Some(l), Some(b)) if l < b => {
                result.push_str(&rest[..l]);
                return result;
            }
            (Some(l), None) => {
                result.push_str(&rest[..l]);
                return result;
            }
            (_, Some(b)) => {
                result.push_str(&rest[..b]);
                result.push(' ');
                *in_block_comment = true;
                rest = &rest[b + 2..];
            }
            (None, None) => {
                result.push_str(rest);
                return result;
            }
        }
    }
}

fn parse_include(directive: &str) -> Option<String> {
    let rest = directive.strip_prefix("include")?.trim_start();
    let (open, close) = match rest.chars().next()? {
        '"' => ('"', '"'),
        '<' => ('<', '>'),
        _ => return None,
    };
    let inner = rest.strip_prefix(open)?;
    let end = inner.find(close)?;
    Some(inner[..end].to_string())
}

fn module_name(rest: &str) -> Option<String> {
    let name = rest.split(';').next()?.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Hierarchical cache of [`SourceFileMetadata`]
pub struct SourceFileMetadataCache {
    hierarchy: CacheHierarchy<SourceFileMetadata>,
}

impl SourceFileMetadataCache {
    /// Load one layer per `(base_dir, cache file)` pair
    pub fn create_hierarchy(bases: impl IntoIterator<Item = (PathBuf, PathBuf)>) -> Self {
        Self {
            hierarchy: CacheHierarchy::load(bases, METADATA_CACHE_VERSION),
        }
    }

    /// Unpersisted cache
    pub fn in_memory() -> Self {
        Self {
            hierarchy: CacheHierarchy::new(Vec::new()),
        }
    }

    fn metadata(&self, item: &FileItem) -> Option<SourceFileMetadata> {
        self.hierarchy.get_or_compute(item, |path| {
            match std::fs::read(path) {
                Ok(bytes) => {
                    let mut metadata = SourceFileMetadata::scan(&String::from_utf8_lossy(&bytes));
                    metadata.content_hash = ContentHash::from_bytes(&bytes);
                    Some(metadata)
                }
                Err(e) => {
                    debug!("Unable to scan {}: {}", path.display(), e);
                    None
                }
            }
        })
    }

    /// Include directives of `item` (empty if unreadable)
    pub fn get_includes(&self, item: &FileItem) -> Vec<String> {
        self.metadata(item)
            .map(|metadata| metadata.includes)
            .unwrap_or_default()
    }

    /// Imported module names of `item`
    pub fn get_imported_modules(&self, item: &FileItem) -> Vec<String> {
        self.metadata(item)
            .map(|metadata| metadata.imported_modules)
            .unwrap_or_default()
    }

    /// Module exported by `item`, if it is an interface unit
    pub fn get_exported_module(&self, item: &FileItem) -> Option<String> {
        self.metadata(item).and_then(|metadata| metadata.exported_module)
    }

    /// Whether `item` declares reflected types
    pub fn contains_reflection_markup(&self, item: &FileItem) -> bool {
        self.metadata(item)
            .is_some_and(|metadata| metadata.has_reflection_markup)
    }

    /// Content fingerprint of `item`
    pub fn get_content_hash(&self, item: &FileItem) -> Option<ContentHash> {
        self.metadata(item).map(|metadata| metadata.content_hash)
    }

    /// Scan many files in parallel
    pub fn prefetch(&self, items: &[Arc<FileItem>]) {
        items.par_iter().for_each(|item| {
            let _ = self.metadata(item);
        });
    }

    /// Persist modified layers
    pub fn save_all(&self) -> BuildResult<()> {
        self.hierarchy.save_all()
    }
}
