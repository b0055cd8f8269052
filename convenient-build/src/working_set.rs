//! Files the user is actively editing
//!
//! Files in the working set are compiled on their own rather than inside
//! unity blobs, so a makefile records which candidate files were in the
//! working set when it was created.

use crate::error::BuildResult;
use crate::file_item::{FileItem, normalize_path};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Membership test for the working set
pub trait WorkingSet: Send + Sync {
    /// Whether `item` is being edited
    fn contains(&self, item: &FileItem) -> bool;
}

/// No file is in the working set
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyWorkingSet;

impl WorkingSet for EmptyWorkingSet {
    fn contains(&self, _item: &FileItem) -> bool {
        false
    }
}

/// Working set given as an explicit list of paths
#[derive(Debug, Default, Clone)]
pub struct FileListWorkingSet {
    files: HashSet<PathBuf>,
}

impl FileListWorkingSet {
    /// Working set from paths
    pub fn new(paths: impl IntoIterator<Item = impl AsRef<Path>>) -> Self {
        Self {
            files: paths
                .into_iter()
                .map(|path| normalize_path(path.as_ref()))
                .collect(),
        }
    }

    /// Read one path per line; blank lines and `#` comments are ignored
    pub fn from_file(path: &Path) -> BuildResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let base = path.parent().unwrap_or(Path::new(""));
        Ok(Self::new(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(|line| base.join(line)),
        ))
    }

    /// Number of files
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl WorkingSet for FileListWorkingSet {
    fn contains(&self, item: &FileItem) -> bool {
        self.files.contains(item.location())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_item::FileItemRegistry;
    use tempfile::TempDir;

    #[test]
    fn test_file_list_relative_to_list_file() {
        let tmp = TempDir::new().unwrap();
        let list = tmp.path().join("working-set.txt");
        std::fs::write(&list, "# edited\nSource/Game.cpp\n\n/abs/Other.cpp\n").unwrap();

        let set = FileListWorkingSet::from_file(&list).unwrap();
        let registry = FileItemRegistry::new();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&registry.get_item_by_path(tmp.path().join("Source/Game.cpp"))));
        assert!(set.contains(&registry.get_item_by_path("/abs/Other.cpp")));
        assert!(!EmptyWorkingSet.contains(&registry.get_item_by_path("/abs/Other.cpp")));
    }
}
