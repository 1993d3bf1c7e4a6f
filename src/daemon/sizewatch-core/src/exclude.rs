//! Compiled exclusion patterns used to prune directories during a scan and
//! to filter paths reported by the watcher.
//!
//! Patterns support `*` (any run of characters within a segment), `**`
//! (any number of segments), `?` (single character), and `[...]` character
//! classes, with `/` as the path separator — the same vocabulary as
//! `globset::Glob`.

use crate::error::{CoreError, CoreResult};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use tracing::warn;

/// A compiled set of exclusion patterns.
///
/// Two pattern families are tracked separately: path patterns (matched
/// against the full path, typically containing `/` or `**`) and bare-name
/// patterns (matched against the basename only). A bare-name match lets
/// the scan engine skip descending into a matched directory entirely,
/// rather than walking it and filtering every descendant individually.
#[derive(Debug, Clone)]
pub struct ExclusionMatcher {
    path_patterns: GlobSet,
    name_patterns: GlobSet,
}

impl ExclusionMatcher {
    /// Compile a list of raw glob patterns. A pattern containing `/` is
    /// treated as a path pattern; otherwise it is treated as a name
    /// pattern and matched against each path component.
    pub fn compile<I, S>(patterns: I) -> CoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut path_builder = GlobSetBuilder::new();
        let mut name_builder = GlobSetBuilder::new();

        for raw in patterns {
            let raw = raw.as_ref();
            let glob = Glob::new(raw)
                .map_err(|e| CoreError::InvalidArgument(format!("invalid pattern {raw:?}: {e}")))?;
            if raw.contains('/') {
                path_builder.add(glob);
            } else {
                name_builder.add(glob);
            }
        }

        let path_patterns = path_builder
            .build()
            .map_err(|e| CoreError::InvalidArgument(e.to_string()))?;
        let name_patterns = name_builder
            .build()
            .map_err(|e| CoreError::InvalidArgument(e.to_string()))?;

        Ok(ExclusionMatcher {
            path_patterns,
            name_patterns,
        })
    }

    /// Compile patterns, discarding (and logging once, at `warn`) any that
    /// fail to parse rather than aborting. A scan should never fail outright
    /// because one `--exclude` flag had a typo; an unparseable pattern is
    /// equivalent to "always false" per spec.
    pub fn compile_lenient<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut path_builder = GlobSetBuilder::new();
        let mut name_builder = GlobSetBuilder::new();

        for raw in patterns {
            let raw = raw.as_ref();
            let glob = match Glob::new(raw) {
                Ok(glob) => glob,
                Err(e) => {
                    warn!(pattern = raw, error = %e, "skipping invalid exclusion pattern");
                    continue;
                }
            };
            if raw.contains('/') {
                path_builder.add(glob);
            } else {
                name_builder.add(glob);
            }
        }

        ExclusionMatcher {
            path_patterns: path_builder.build().unwrap_or_else(|_| GlobSet::empty()),
            name_patterns: name_builder.build().unwrap_or_else(|_| GlobSet::empty()),
        }
    }

    pub fn empty() -> Self {
        ExclusionMatcher {
            path_patterns: GlobSet::empty(),
            name_patterns: GlobSet::empty(),
        }
    }

    /// True if the bare file/directory name matches an exclusion pattern.
    /// Used by the scan engine to decide whether to descend into a
    /// directory at all, without first building its full path patterns.
    pub fn matches_name(&self, name: &str) -> bool {
        self.name_patterns.is_match(name)
    }

    /// True if the full path matches any path or name pattern.
    pub fn matches_path(&self, path: &Path) -> bool {
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if self.name_patterns.is_match(name) {
                return true;
            }
        }
        self.path_patterns.is_match(path)
    }

    pub fn is_empty(&self) -> bool {
        self.path_patterns.len() == 0 && self.name_patterns.len() == 0
    }
}

impl Default for ExclusionMatcher {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn name_pattern_excludes_any_matching_basename() {
        let m = ExclusionMatcher::compile(["node_modules", "*.tmp"]).unwrap();
        assert!(m.matches_name("node_modules"));
        assert!(m.matches_name("foo.tmp"));
        assert!(!m.matches_name("src"));
        assert!(m.matches_path(&PathBuf::from("/a/b/node_modules")));
        assert!(m.matches_path(&PathBuf::from("/a/b/c.tmp")));
    }

    #[test]
    fn path_pattern_requires_full_path_match() {
        let m = ExclusionMatcher::compile(["**/target/**"]).unwrap();
        assert!(m.matches_path(&PathBuf::from("/repo/target/debug/build")));
        assert!(!m.matches_path(&PathBuf::from("/repo/targetfoo/debug")));
    }

    #[test]
    fn empty_matcher_excludes_nothing() {
        let m = ExclusionMatcher::empty();
        assert!(!m.matches_path(&PathBuf::from("/anything")));
        assert!(m.is_empty());
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = ExclusionMatcher::compile(["[unterminated"]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[test]
    fn lenient_compile_skips_invalid_patterns_and_keeps_the_rest() {
        let m = ExclusionMatcher::compile_lenient(["[unterminated", "**/excluded/**"]);
        assert!(m.matches_path(&PathBuf::from("/root/excluded/huge.bin")));
    }
}
