//! Post-enumeration filter applied to a slice of [`FileRecord`]s: size,
//! extension, age, depth, include/exclude globs, sort, and a result cap.

use crate::exclude::ExclusionMatcher;
use crate::record::FileRecord;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::cmp::Ordering;
use std::path::Path;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Size,
    Age,
    Path,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// An immutable filter specification. Build with [`FilterBuilder`] or
/// construct a default and adjust fields directly — all fields are public
/// because this is a plain value, not an invariant-bearing type.
#[derive(Debug, Clone)]
pub struct Filter {
    pub min_size: u64,
    pub include: GlobSet,
    pub exclude: ExclusionMatcher,
    /// Lowercased, leading-dot-normalized (`".rs"`, not `"rs"`).
    pub extensions: Vec<String>,
    pub modified_before: Option<SystemTime>,
    pub modified_after: Option<SystemTime>,
    /// `<= 0` means unbounded.
    pub max_depth: i64,
    pub sort_key: SortKey,
    pub sort_direction: SortDirection,
    /// `0` means unbounded.
    pub limit: usize,
}

impl Default for Filter {
    fn default() -> Self {
        Filter {
            min_size: 0,
            include: GlobSet::empty(),
            exclude: ExclusionMatcher::empty(),
            extensions: Vec::new(),
            modified_before: None,
            modified_after: None,
            max_depth: 0,
            sort_key: SortKey::Size,
            sort_direction: SortDirection::Descending,
            limit: 0,
        }
    }
}

impl Filter {
    pub fn with_min_size(mut self, min_size: u64) -> Self {
        self.min_size = min_size;
        self
    }

    pub fn with_exclude(mut self, exclude: ExclusionMatcher) -> Self {
        self.exclude = exclude;
        self
    }

    pub fn with_include_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = GlobSetBuilder::new();
        for raw in patterns {
            if let Ok(glob) = Glob::new(raw.as_ref()) {
                builder.add(glob);
            }
        }
        self.include = builder.build().unwrap_or_else(|_| GlobSet::empty());
        self
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.extensions = extensions
            .into_iter()
            .map(|e| normalize_extension(e.as_ref()))
            .collect();
        self
    }

    pub fn with_max_depth(mut self, max_depth: i64) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_sort(mut self, key: SortKey, direction: SortDirection) -> Self {
        self.sort_key = key;
        self.sort_direction = direction;
        self
    }

    /// Depth of `path` relative to `root`: the number of path components
    /// between them. `root` itself is depth 0.
    pub fn depth_of(root: &Path, path: &Path) -> i64 {
        path.strip_prefix(root)
            .map(|rel| rel.components().count() as i64)
            .unwrap_or(0)
    }

    fn retain(&self, record: &FileRecord, root: &Path) -> bool {
        if record.size < self.min_size {
            return false;
        }

        if !self.extensions.is_empty() {
            match record.extension_lower() {
                Some(ext) if self.extensions.iter().any(|e| e.trim_start_matches('.') == ext) => {}
                _ => return false,
            }
        }

        if self.max_depth > 0 && Self::depth_of(root, &record.path) > self.max_depth {
            return false;
        }

        if let Some(before) = self.modified_before {
            if record.modified >= before {
                return false;
            }
        }
        if let Some(after) = self.modified_after {
            if record.modified <= after {
                return false;
            }
        }

        if self.exclude.matches_path(&record.path) {
            return false;
        }

        if self.include.len() > 0 && !self.include.is_match(&record.path) {
            return false;
        }

        true
    }

    /// Apply the filter: retain, sort, then cap. `root` is used to compute
    /// relative depth for the `max_depth` predicate.
    pub fn apply(&self, mut files: Vec<FileRecord>, root: &Path) -> Vec<FileRecord> {
        files.retain(|f| self.retain(f, root));

        files.sort_by(|a, b| {
            let ordering = match self.sort_key {
                SortKey::Size => a.size.cmp(&b.size),
                SortKey::Age => {
                    // Older is "greater" so ascending puts oldest first.
                    b.modified.cmp(&a.modified)
                }
                SortKey::Path => a.path.cmp(&b.path),
            };
            match self.sort_direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            }
        });

        if self.limit > 0 && files.len() > self.limit {
            files.truncate(self.limit);
        }
        files
    }
}

fn normalize_extension(raw: &str) -> String {
    let lower = raw.to_ascii_lowercase();
    if lower.starts_with('.') {
        lower
    } else {
        format!(".{lower}")
    }
}

/// Ordering used directly by callers that only need a comparator, e.g. the
/// index store's default `GetLargeFiles` stream (size descending).
pub fn size_descending(a: &FileRecord, b: &FileRecord) -> Ordering {
    b.size.cmp(&a.size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn record(path: &str, size: u64, modified: SystemTime) -> FileRecord {
        FileRecord {
            path: PathBuf::from(path),
            size,
            modified,
            created: None,
            mode: 0o644,
            owner: String::new(),
            group: String::new(),
        }
    }

    #[test]
    fn min_size_filters_out_small_files() {
        let filter = Filter::default().with_min_size(100);
        let now = SystemTime::now();
        let files = vec![record("/r/a", 50, now), record("/r/b", 150, now)];
        let result = filter.apply(files, Path::new("/r"));
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].path, PathBuf::from("/r/b"));
    }

    #[test]
    fn sorts_by_size_descending_by_default() {
        let now = SystemTime::now();
        let files = vec![
            record("/r/a", 300, now),
            record("/r/b", 100, now),
            record("/r/c", 200, now),
        ];
        let result = Filter::default().apply(files, Path::new("/r"));
        let sizes: Vec<_> = result.iter().map(|f| f.size).collect();
        assert_eq!(sizes, vec![300, 200, 100]);
    }

    #[test]
    fn limit_caps_after_sort() {
        let now = SystemTime::now();
        let files = vec![
            record("/r/a", 300, now),
            record("/r/b", 100, now),
            record("/r/c", 200, now),
        ];
        let result = Filter::default().with_limit(2).apply(files, Path::new("/r"));
        let sizes: Vec<_> = result.iter().map(|f| f.size).collect();
        assert_eq!(sizes, vec![300, 200]);
    }

    #[test]
    fn max_depth_excludes_deeper_descendants() {
        let now = SystemTime::now();
        let files = vec![record("/r/a", 100, now), record("/r/sub/deep/b", 100, now)];
        let result = Filter::default().with_max_depth(1).apply(files, Path::new("/r"));
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].path, PathBuf::from("/r/a"));
    }

    #[test]
    fn extension_allow_list_matches_case_insensitively() {
        let now = SystemTime::now();
        let files = vec![record("/r/a.RS", 100, now), record("/r/b.txt", 100, now)];
        let result = Filter::default()
            .with_extensions([".rs"])
            .apply(files, Path::new("/r"));
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].path, PathBuf::from("/r/a.RS"));
    }

    #[test]
    fn age_predicates_bound_modification_time() {
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let older = base - Duration::from_secs(10_000);
        let newer = base + Duration::from_secs(10_000);
        let files = vec![record("/r/old", 100, older), record("/r/new", 100, newer)];
        let result = Filter::default()
            .apply(files.clone(), Path::new("/r"));
        assert_eq!(result.len(), 2);

        let mut only_older = Filter::default();
        only_older.modified_before = Some(base);
        let result = only_older.apply(files, Path::new("/r"));
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].path, PathBuf::from("/r/old"));
    }

    #[test]
    fn exclude_pattern_drops_matching_paths() {
        let now = SystemTime::now();
        let files = vec![
            record("/r/keep.bin", 100, now),
            record("/r/excluded/huge.bin", 100, now),
        ];
        let filter =
            Filter::default().with_exclude(ExclusionMatcher::compile(["**/excluded/**"]).unwrap());
        let result = filter.apply(files, Path::new("/r"));
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].path, PathBuf::from("/r/keep.bin"));
    }
}
