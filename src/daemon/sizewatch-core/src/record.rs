//! Catalog entry types: [`FileRecord`], [`DirAggregate`], and [`TreeNode`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// A single large-file catalog entry.
///
/// Invariants (enforced by whoever constructs one, not by this type):
/// `size >= index.threshold`, `path` is absolute with the index root as a
/// prefix, and `path` is unique within a single index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
    pub created: Option<SystemTime>,
    pub mode: u32,
    /// Best-effort; empty when the owner/group name could not be resolved.
    pub owner: String,
    pub group: String,
}

impl FileRecord {
    /// Parent directory, derived from `path`.
    pub fn parent_dir(&self) -> Option<&Path> {
        self.path.parent()
    }

    pub fn extension_lower(&self) -> Option<String> {
        self.path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
    }
}

/// A rolled-up summary for an interior tree node: the count and total size
/// of every [`FileRecord`] at or beneath a directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirAggregate {
    pub count: u64,
    pub bytes: u64,
}

impl DirAggregate {
    pub fn add(&mut self, size: u64) {
        self.count += 1;
        self.bytes += size;
    }

    pub fn remove(&mut self, size: u64) {
        self.count = self.count.saturating_sub(1);
        self.bytes = self.bytes.saturating_sub(size);
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// A materialized node in a `GetTree` response: either a file leaf or a
/// directory carrying its rolled-up aggregate and sorted children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub path: PathBuf,
    pub basename: String,
    pub is_dir: bool,
    /// File size for a leaf, aggregate byte total for a directory.
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    pub fn leaf(record: &FileRecord) -> Self {
        TreeNode {
            path: record.path.clone(),
            basename: basename_of(&record.path),
            is_dir: false,
            size: record.size,
            modified: Some(record.modified),
            children: Vec::new(),
        }
    }

    pub fn dir(path: PathBuf, aggregate: DirAggregate) -> Self {
        let basename = basename_of(&path);
        TreeNode {
            path,
            basename,
            is_dir: true,
            size: aggregate.bytes,
            modified: None,
            children: Vec::new(),
        }
    }

    /// Sort children: directories before files with the same parent,
    /// both ascending by basename.
    pub fn sort_children(&mut self) {
        self.children
            .sort_by(|a, b| match (a.is_dir, b.is_dir) {
                (true, false) => std::cmp::Ordering::Less,
                (false, true) => std::cmp::Ordering::Greater,
                _ => a.basename.cmp(&b.basename),
            });
        for child in &mut self.children {
            child.sort_children();
        }
    }
}

fn basename_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, size: u64) -> FileRecord {
        FileRecord {
            path: PathBuf::from(path),
            size,
            modified: SystemTime::UNIX_EPOCH,
            created: None,
            mode: 0o644,
            owner: String::new(),
            group: String::new(),
        }
    }

    #[test]
    fn aggregate_add_remove_is_consistent() {
        let mut agg = DirAggregate::default();
        agg.add(100);
        agg.add(200);
        assert_eq!(agg, DirAggregate { count: 2, bytes: 300 });
        agg.remove(100);
        assert_eq!(agg, DirAggregate { count: 1, bytes: 200 });
        assert!(!agg.is_empty());
        agg.remove(200);
        assert!(agg.is_empty());
    }

    #[test]
    fn tree_sort_puts_dirs_before_files_then_basename_ascending() {
        let mut root = TreeNode::dir(PathBuf::from("/root"), DirAggregate { count: 2, bytes: 420 });
        root.children.push(TreeNode::leaf(&record("/root/b.bin", 120)));
        root.children
            .push(TreeNode::dir(PathBuf::from("/root/sub"), DirAggregate { count: 1, bytes: 300 }));
        root.children.push(TreeNode::leaf(&record("/root/a.bin", 10)));
        root.sort_children();

        let names: Vec<_> = root.children.iter().map(|c| c.basename.as_str()).collect();
        assert_eq!(names, vec!["sub", "a.bin", "b.bin"]);
    }
}
