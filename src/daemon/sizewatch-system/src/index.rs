//! Index store: owns the large-file catalog and directory aggregates for
//! every watched root, and applies watcher-driven [`ChangeEvent`]s to keep
//! them current (spec.md §4.5).

use crate::ids;
use crate::scan::ScanOutcome;
use dashmap::DashMap;
use sizewatch_core::{
    ChangeEvent, ChangeKind, CoreError, CoreResult, DirAggregate, ExclusionMatcher, Filter,
    FileRecord, IndexState, IndexStatus, TreeNode,
};
use std::collections::HashMap;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

/// The catalog and aggregates for a single watched root, plus its lifecycle
/// state. Structural mutations (upsert/remove, and the state transitions
/// around them) all go through the one `RwLock`; `large_files`/`tree`/
/// `status` take a shared read lock.
pub struct Index {
    root: PathBuf,
    threshold: RwLock<u64>,
    exclude: RwLock<ExclusionMatcher>,
    data: RwLock<IndexData>,
}

struct IndexData {
    files: HashMap<PathBuf, FileRecord>,
    aggregates: HashMap<PathBuf, DirAggregate>,
    status: IndexStatus,
}

impl Index {
    pub fn new(root: PathBuf, threshold: u64, exclude: ExclusionMatcher) -> Self {
        let status = IndexStatus::not_indexed(root.clone());
        Index {
            root,
            threshold: RwLock::new(threshold),
            exclude: RwLock::new(exclude),
            data: RwLock::new(IndexData {
                files: HashMap::new(),
                aggregates: HashMap::new(),
                status,
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn threshold(&self) -> u64 {
        *self.threshold.read().unwrap()
    }

    pub fn exclude(&self) -> ExclusionMatcher {
        self.exclude.read().unwrap().clone()
    }

    /// Flip to INDEXING if idle, or if `force`. Returns whether a scan
    /// should actually be kicked off by the caller.
    pub fn begin_indexing(&self, force: bool) -> CoreResult<bool> {
        let mut data = self.data.write().unwrap();
        if data.status.state == IndexState::Indexing && !force {
            return Err(CoreError::Busy(self.root.clone()));
        }
        data.status.state = IndexState::Indexing;
        data.status.last_scan_started = Some(SystemTime::now());
        data.status.progress = 0.0;
        Ok(true)
    }

    pub fn set_progress(&self, fraction: f32) {
        let mut data = self.data.write().unwrap();
        if data.status.state == IndexState::Indexing {
            data.status.progress = fraction.clamp(0.0, 1.0);
        }
    }

    /// Replace the catalog wholesale with a completed scan's results and
    /// transition to READY. Used for the initial scan and any full
    /// re-scan triggered by a RESYNC_REQUIRED or an explicit `force`.
    pub fn apply_scan_outcome(&self, outcome: ScanOutcome) {
        let mut files = HashMap::with_capacity(outcome.files.len());
        let mut aggregates: HashMap<PathBuf, DirAggregate> = HashMap::new();

        for record in outcome.files {
            for ancestor in ancestors_from(&self.root, &record.path) {
                aggregates.entry(ancestor).or_default().add(record.size);
            }
            files.insert(record.path.clone(), record);
        }

        let mut data = self.data.write().unwrap();
        data.files = files;
        data.aggregates = aggregates;
        data.status.state = IndexState::Ready;
        data.status.file_count = data.files.len() as u64;
        data.status.total_bytes = data.files.values().map(|f| f.size).sum();
        data.status.last_scan_completed = Some(SystemTime::now());
        data.status.scan_error_count = outcome.errors.len() as u64;
        data.status.progress = 1.0;
    }

    pub fn mark_watching(&self, watching: bool) {
        self.data.write().unwrap().status.watching = watching;
    }

    /// A RESYNC_REQUIRED signal from the watcher: the catalog can no
    /// longer be trusted until a full re-scan completes.
    pub fn mark_stale(&self) {
        self.data.write().unwrap().status.state = IndexState::Stale;
    }

    pub fn status(&self) -> IndexStatus {
        self.data.read().unwrap().status.clone()
    }

    pub fn large_files(&self, filter: &Filter) -> CoreResult<Vec<FileRecord>> {
        let data = self.data.read().unwrap();
        self.require_ready(&data)?;
        let files: Vec<_> = data.files.values().cloned().collect();
        Ok(filter.apply(files, &self.root))
    }

    pub fn tree(&self, filter: &Filter) -> CoreResult<TreeNode> {
        let data = self.data.read().unwrap();
        self.require_ready(&data)?;

        let root_agg = data.aggregates.get(&self.root).copied().unwrap_or_default();
        let mut root_node = TreeNode::dir(self.root.clone(), root_agg);
        self.materialize(&data, &mut root_node, filter);
        root_node.sort_children();
        Ok(root_node)
    }

    fn materialize(&self, data: &IndexData, node: &mut TreeNode, filter: &Filter) {
        let mut child_dirs: HashMap<PathBuf, DirAggregate> = HashMap::new();
        let mut child_files: Vec<&FileRecord> = Vec::new();

        for (dir_path, agg) in data.aggregates.iter() {
            if agg.is_empty() {
                continue;
            }
            if dir_path.parent() == Some(node.path.as_path()) {
                child_dirs.insert(dir_path.clone(), *agg);
            }
        }
        for record in data.files.values() {
            if record.parent_dir() == Some(node.path.as_path()) {
                child_files.push(record);
            }
        }

        for (dir_path, agg) in child_dirs {
            let mut child = TreeNode::dir(dir_path, agg);
            self.materialize(data, &mut child, filter);
            node.children.push(child);
        }
        for record in child_files {
            if record.size < filter.min_size || filter.exclude.matches_path(&record.path) {
                continue;
            }
            node.children.push(TreeNode::leaf(record));
        }
    }

    pub fn clear(&self) -> u64 {
        let mut data = self.data.write().unwrap();
        let cleared = data.files.len() as u64;
        data.files.clear();
        data.aggregates.clear();
        data.status.state = IndexState::NotIndexed;
        data.status.file_count = 0;
        data.status.total_bytes = 0;
        data.status.progress = 0.0;
        cleared
    }

    fn require_ready(&self, data: &IndexData) -> CoreResult<()> {
        match data.status.state {
            IndexState::Ready | IndexState::Indexing => Ok(()),
            IndexState::NotIndexed | IndexState::Stale => Err(CoreError::NotReady(self.root.clone())),
        }
    }

    /// Apply one watcher-normalized change. Returns the event to forward to
    /// subscribers, or `None` if the change was a no-op (e.g. a rename of a
    /// file that never met the threshold).
    pub fn apply_event(&self, event: &ChangeEvent) -> Option<ChangeEvent> {
        let threshold = self.threshold();
        let exclude = self.exclude();

        match event.kind {
            ChangeKind::Created | ChangeKind::Modified => {
                self.apply_upsert(&event.path, threshold, &exclude, event.observed_at)
            }
            ChangeKind::Removed => self.apply_removal(&event.path, event.observed_at),
            ChangeKind::Renamed => {
                let from = event.from.clone().unwrap_or_else(|| event.path.clone());
                self.apply_removal(&from, event.observed_at);
                self.apply_upsert(&event.path, threshold, &exclude, event.observed_at)
            }
        }
    }

    fn apply_upsert(
        &self,
        path: &Path,
        threshold: u64,
        exclude: &ExclusionMatcher,
        observed_at: SystemTime,
    ) -> Option<ChangeEvent> {
        let fresh = stat_full(path).filter(|r| r.size >= threshold && !exclude.matches_path(path));

        let mut data = self.data.write().unwrap();
        let existing = data.files.get(path).cloned();

        let Some(record) = fresh else {
            return existing.map(|old| {
                self.remove_locked(&mut data, &old);
                ChangeEvent::removed(path.to_path_buf(), observed_at)
            });
        };

        if let Some(old) = &existing {
            if old.size == record.size && old.modified == record.modified {
                return None;
            }
        }

        let delta = record.size as i64 - existing.as_ref().map(|r| r.size as i64).unwrap_or(0);
        for ancestor in ancestors_from(&self.root, path) {
            let agg = data.aggregates.entry(ancestor).or_default();
            if existing.is_some() {
                if delta >= 0 {
                    agg.bytes += delta as u64;
                } else {
                    agg.bytes = agg.bytes.saturating_sub((-delta) as u64);
                }
            } else {
                agg.add(record.size);
            }
        }

        let is_new = existing.is_none();
        data.files.insert(path.to_path_buf(), record.clone());
        data.status.file_count = data.files.len() as u64;
        data.status.total_bytes = data.files.values().map(|f| f.size).sum();

        Some(if is_new {
            ChangeEvent::created(path.to_path_buf(), record.size, observed_at)
        } else {
            ChangeEvent::modified(path.to_path_buf(), record.size, observed_at)
        })
    }

    fn apply_removal(&self, path: &Path, observed_at: SystemTime) -> Option<ChangeEvent> {
        let mut data = self.data.write().unwrap();
        let old = data.files.get(path).cloned()?;
        self.remove_locked(&mut data, &old);
        Some(ChangeEvent::removed(path.to_path_buf(), observed_at))
    }

    fn remove_locked(&self, data: &mut IndexData, old: &FileRecord) {
        for ancestor in ancestors_from(&self.root, &old.path) {
            if let Some(agg) = data.aggregates.get_mut(&ancestor) {
                agg.remove(old.size);
            }
        }
        data.files.remove(&old.path);
        data.status.file_count = data.files.len() as u64;
        data.status.total_bytes = data.files.values().map(|f| f.size).sum();
    }
}

/// Every ancestor directory from `path`'s parent up to and including
/// `root`, nearest first. Empty if `path` is not under `root`.
fn ancestors_from(root: &Path, path: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut current = path.parent();
    while let Some(dir) = current {
        out.push(dir.to_path_buf());
        if dir == root {
            break;
        }
        current = dir.parent();
    }
    out
}

fn stat_full(path: &Path) -> Option<FileRecord> {
    let meta = std::fs::metadata(path).ok()?;
    if meta.is_dir() {
        return None;
    }
    let modified = meta.modified().ok()?;
    Some(FileRecord {
        path: path.to_path_buf(),
        size: meta.len(),
        modified,
        created: meta.created().ok(),
        mode: meta.permissions().mode(),
        owner: ids::username(meta.uid()),
        group: ids::groupname(meta.gid()),
    })
}

/// Holds one [`Index`] per watched root, keyed by canonical root path.
#[derive(Default)]
pub struct IndexManager {
    roots: DashMap<PathBuf, Arc<Index>>,
}

impl IndexManager {
    pub fn new() -> Self {
        IndexManager::default()
    }

    /// Idempotent: returns the existing index for `root` if already
    /// ensured, otherwise validates and creates a fresh `NOT_INDEXED` one.
    pub fn ensure(
        &self,
        root: PathBuf,
        threshold: u64,
        exclude: ExclusionMatcher,
    ) -> CoreResult<Arc<Index>> {
        if let Some(existing) = self.roots.get(&root) {
            return Ok(Arc::clone(&existing));
        }

        let meta = std::fs::symlink_metadata(&root).map_err(|_| CoreError::NotFound(root.clone()))?;
        if !meta.is_dir() {
            return Err(CoreError::NotADirectory(root.clone()));
        }

        let index = Arc::new(Index::new(root.clone(), threshold, exclude));
        self.roots.insert(root, Arc::clone(&index));
        Ok(index)
    }

    pub fn get(&self, root: &Path) -> CoreResult<Arc<Index>> {
        self.roots
            .get(root)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| CoreError::UnknownRoot(root.to_path_buf()))
    }

    pub fn roots(&self) -> Vec<PathBuf> {
        self.roots.iter().map(|e| e.key().clone()).collect()
    }

    pub fn clear(&self, path: Option<&Path>) -> u64 {
        match path {
            Some(root) => self.roots.get(root).map(|i| i.clear()).unwrap_or(0),
            None => self.roots.iter().map(|e| e.clear()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sizewatch_core::ScanErrorRecord;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    fn record(root: &Path, rel: &str, size: u64) -> FileRecord {
        FileRecord {
            path: root.join(rel),
            size,
            modified: SystemTime::now(),
            created: None,
            mode: 0o644,
            owner: String::new(),
            group: String::new(),
        }
    }

    #[test]
    fn scan_outcome_seeds_catalog_and_aggregates() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        fs::create_dir(root.join("sub")).unwrap();

        let index = Index::new(root.clone(), 0, ExclusionMatcher::empty());
        index.begin_indexing(false).unwrap();
        index.apply_scan_outcome(ScanOutcome {
            files: vec![record(&root, "a.bin", 100), record(&root, "sub/b.bin", 200)],
            stats: crate::scan::ScanStatsSnapshot {
                dirs_scanned: 2,
                files_scanned: 2,
                files_matched: 2,
                interrupted: false,
            },
            errors: Vec::<ScanErrorRecord>::new(),
        });

        let status = index.status();
        assert_eq!(status.state, IndexState::Ready);
        assert_eq!(status.file_count, 2);
        assert_eq!(status.total_bytes, 300);

        let tree = index.tree(&Filter::default()).unwrap();
        assert_eq!(tree.size, 300);
        let sub = tree.children.iter().find(|c| c.basename == "sub").unwrap();
        assert_eq!(sub.size, 200);
    }

    #[test]
    fn apply_event_upsert_then_remove_keeps_aggregates_consistent() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let target = root.join("big.bin");
        fs::write(&target, vec![0u8; 1024]).unwrap();

        let index = Index::new(root.clone(), 500, ExclusionMatcher::empty());
        index.begin_indexing(false).unwrap();
        index.apply_scan_outcome(ScanOutcome {
            files: Vec::new(),
            stats: Default::default(),
            errors: Vec::new(),
        });

        let created = index
            .apply_event(&ChangeEvent::created(target.clone(), 1024, SystemTime::now()))
            .expect("upsert should emit");
        assert_eq!(created.kind, ChangeKind::Created);
        assert_eq!(index.status().file_count, 1);
        assert_eq!(index.status().total_bytes, 1024);

        fs::remove_file(&target).unwrap();
        let removed = index
            .apply_event(&ChangeEvent::removed(target.clone(), SystemTime::now()))
            .expect("removal should emit");
        assert_eq!(removed.kind, ChangeKind::Removed);
        assert_eq!(index.status().file_count, 0);
        assert_eq!(index.status().total_bytes, 0);
    }

    #[test]
    fn below_threshold_upsert_is_dropped_without_existing_entry() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let small = root.join("small.bin");
        fs::write(&small, vec![0u8; 10]).unwrap();

        let index = Index::new(root.clone(), 1_000_000, ExclusionMatcher::empty());
        index.begin_indexing(false).unwrap();
        index.apply_scan_outcome(ScanOutcome {
            files: Vec::new(),
            stats: Default::default(),
            errors: Vec::new(),
        });

        let result = index.apply_event(&ChangeEvent::created(small, 10, SystemTime::now()));
        assert!(result.is_none());
        assert_eq!(index.status().file_count, 0);
    }

    #[test]
    fn idempotent_modify_with_unchanged_size_and_mtime_is_a_no_op() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let target = root.join("steady.bin");
        fs::write(&target, vec![0u8; 1024]).unwrap();

        let index = Index::new(root.clone(), 0, ExclusionMatcher::empty());
        index.begin_indexing(false).unwrap();
        index.apply_scan_outcome(ScanOutcome {
            files: Vec::new(),
            stats: Default::default(),
            errors: Vec::new(),
        });

        let first = index.apply_event(&ChangeEvent::modified(target.clone(), 1024, SystemTime::now()));
        assert!(first.is_some());
        let second = index.apply_event(&ChangeEvent::modified(target, 1024, SystemTime::now()));
        assert!(second.is_none(), "unchanged size+mtime should be a no-op");
    }

    #[test]
    fn manager_rejects_unknown_root() {
        let manager = IndexManager::new();
        let err = manager.get(Path::new("/never/ensured")).unwrap_err();
        assert!(matches!(err, CoreError::UnknownRoot(_)));
    }

    #[test]
    fn manager_ensure_is_idempotent() {
        let dir = tempdir().unwrap();
        let manager = IndexManager::new();
        let first = manager
            .ensure(dir.path().to_path_buf(), 0, ExclusionMatcher::empty())
            .unwrap();
        let second = manager
            .ensure(dir.path().to_path_buf(), 999, ExclusionMatcher::empty())
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.threshold(), 0, "ensure is a no-op on an already-tracked root");
    }

    #[test]
    fn busy_trigger_without_force_is_rejected() {
        let dir = tempdir().unwrap();
        let index = Index::new(dir.path().to_path_buf(), 0, ExclusionMatcher::empty());
        index.begin_indexing(false).unwrap();
        let err = index.begin_indexing(false).unwrap_err();
        assert!(matches!(err, CoreError::Busy(_)));
        assert!(index.begin_indexing(true).is_ok());
    }

    #[test]
    fn clear_resets_to_not_indexed() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let index = Index::new(root.clone(), 0, ExclusionMatcher::empty());
        index.begin_indexing(false).unwrap();
        index.apply_scan_outcome(ScanOutcome {
            files: vec![record(&root, "a.bin", 100)],
            stats: Default::default(),
            errors: Vec::new(),
        });
        assert_eq!(index.clear(), 1);
        assert_eq!(index.status().state, IndexState::NotIndexed);
    }

    #[test]
    fn reading_before_ever_indexed_is_not_ready() {
        let dir = tempdir().unwrap();
        let index = Index::new(dir.path().to_path_buf(), 0, ExclusionMatcher::empty());
        let err = index.large_files(&Filter::default()).unwrap_err();
        assert!(matches!(err, CoreError::NotReady(_)));
        let _ = Duration::from_secs(0);
    }
}
