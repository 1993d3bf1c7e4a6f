//! Parallel directory-traversal scan engine: §4.3 of spec.md.
//!
//! Two decoupled worker pools — directory workers and file workers —
//! connected by bounded `crossbeam_channel`s, plus a result stage. This is
//! plain-thread, not `tokio`, because the work is blocking filesystem
//! syscalls from end to end; the daemon invokes `scan` through
//! `tokio::task::spawn_blocking`.

use crate::ids;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use sizewatch_core::{CoreError, CoreResult, ExclusionMatcher, FileRecord, ScanErrorRecord};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Options for a single scan run.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub root: PathBuf,
    pub min_size: u64,
    pub exclude: ExclusionMatcher,
    pub dir_workers: usize,
    pub file_workers: usize,
}

impl ScanOptions {
    pub fn new(root: PathBuf, min_size: u64) -> Self {
        let cpus = num_cpus::get().max(1);
        ScanOptions {
            root,
            min_size,
            exclude: ExclusionMatcher::empty(),
            dir_workers: cpus,
            file_workers: cpus * 2,
        }
    }
}

/// Cumulative counters for a scan run. Updated monotonically as the scan
/// progresses, so a reader polling mid-scan sees a valid (if incomplete)
/// snapshot.
#[derive(Debug, Default)]
pub struct ScanStats {
    pub dirs_scanned: AtomicU64,
    pub files_scanned: AtomicU64,
    pub files_matched: AtomicU64,
    pub interrupted: AtomicBool,
}

impl ScanStats {
    pub fn snapshot(&self) -> ScanStatsSnapshot {
        ScanStatsSnapshot {
            dirs_scanned: self.dirs_scanned.load(Ordering::Relaxed),
            files_scanned: self.files_scanned.load(Ordering::Relaxed),
            files_matched: self.files_matched.load(Ordering::Relaxed),
            interrupted: self.interrupted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanStatsSnapshot {
    pub dirs_scanned: u64,
    pub files_scanned: u64,
    pub files_matched: u64,
    pub interrupted: bool,
}

/// A cooperative cancellation flag, polled at every channel receive and
/// between enumeration iterations. Cheap to clone; all clones share one
/// underlying flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

pub struct ScanOutcome {
    pub files: Vec<FileRecord>,
    pub stats: ScanStatsSnapshot,
    pub errors: Vec<ScanErrorRecord>,
}

/// Poll interval used by worker loops to re-check the shared in-flight
/// counter and the cancellation token while channels are briefly empty.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Run a scan to completion and collect every matched [`FileRecord`] into
/// `ScanOutcome::files`. Convenience wrapper around [`scan_streaming`] for
/// callers (the CLI's daemonless `scan` subcommand, tests) that just want
/// the final list rather than a live feed.
pub fn scan(opts: ScanOptions, cancel: CancelToken) -> CoreResult<ScanOutcome> {
    let mut files = Vec::new();
    let mut outcome = scan_streaming(opts, cancel, |record| files.push(record))?;
    outcome.files = files;
    Ok(outcome)
}

/// Run a scan to completion, streaming matched [`FileRecord`]s to `on_record`
/// as they're produced (for the daemon's streaming `GetLargeFiles`/index
/// seed) and returning the aggregate stats and accumulated errors once every
/// worker has drained. `ScanOutcome::files` is left empty — the records
/// already went to `on_record`.
pub fn scan_streaming(
    opts: ScanOptions,
    cancel: CancelToken,
    on_record: impl FnMut(FileRecord) + Send,
) -> CoreResult<ScanOutcome> {
    scan_streaming_with_stats(opts, cancel, Arc::new(ScanStats::default()), on_record)
}

/// Same as [`scan_streaming`], but the caller supplies the `ScanStats` the
/// run accumulates into rather than receiving it only in the final
/// `ScanOutcome`. Lets a caller running this on a `spawn_blocking` thread
/// poll `stats.snapshot()` from another task while the scan is still
/// in-flight, for a live progress estimate.
pub fn scan_streaming_with_stats(
    opts: ScanOptions,
    cancel: CancelToken,
    stats: Arc<ScanStats>,
    mut on_record: impl FnMut(FileRecord) + Send,
) -> CoreResult<ScanOutcome> {
    let root_meta = std::fs::symlink_metadata(&opts.root)
        .map_err(|_| CoreError::NotFound(opts.root.clone()))?;
    if !root_meta.is_dir() {
        return Err(CoreError::NotADirectory(opts.root.clone()));
    }

    let (dir_tx, dir_rx) = bounded::<PathBuf>(1024);
    let (file_tx, file_rx) = bounded::<(PathBuf, Option<u64>)>(4096);
    let inflight = Arc::new(AtomicI64::new(1));
    let errors: Arc<std::sync::Mutex<Vec<ScanErrorRecord>>> = Arc::new(std::sync::Mutex::new(Vec::new()));

    dir_tx
        .send(opts.root.clone())
        .expect("dir channel just created, cannot be disconnected");

    std::thread::scope(|scope| {
        for _ in 0..opts.dir_workers.max(1) {
            let dir_rx = dir_rx.clone();
            let dir_tx = dir_tx.clone();
            let file_tx = file_tx.clone();
            let stats = Arc::clone(&stats);
            let inflight = Arc::clone(&inflight);
            let errors = Arc::clone(&errors);
            let exclude = opts.exclude.clone();
            let cancel = cancel.clone();
            scope.spawn(move || {
                dir_worker(dir_rx, dir_tx, file_tx, stats, inflight, errors, exclude, cancel)
            });
        }
        drop(dir_tx);
        drop(dir_rx);

        let (record_tx, record_rx) = bounded::<FileRecord>(4096);
        for _ in 0..opts.file_workers.max(1) {
            let file_rx = file_rx.clone();
            let record_tx = record_tx.clone();
            let stats = Arc::clone(&stats);
            let inflight = Arc::clone(&inflight);
            let errors = Arc::clone(&errors);
            let min_size = opts.min_size;
            let cancel = cancel.clone();
            scope.spawn(move || {
                file_worker(file_rx, record_tx, stats, inflight, errors, min_size, cancel)
            });
        }
        drop(file_tx);
        drop(file_rx);
        drop(record_tx);

        for record in record_rx.iter() {
            on_record(record);
        }
    });

    if cancel.is_cancelled() {
        stats.interrupted.store(true, Ordering::SeqCst);
    }

    let errors = Arc::try_unwrap(errors)
        .map(|m| m.into_inner().unwrap_or_default())
        .unwrap_or_default();

    Ok(ScanOutcome {
        files: Vec::new(),
        stats: stats.snapshot(),
        errors,
    })
}

#[allow(clippy::too_many_arguments)]
fn dir_worker(
    dir_rx: crossbeam_channel::Receiver<PathBuf>,
    dir_tx: Sender<PathBuf>,
    file_tx: Sender<(PathBuf, Option<u64>)>,
    stats: Arc<ScanStats>,
    inflight: Arc<AtomicI64>,
    errors: Arc<std::sync::Mutex<Vec<ScanErrorRecord>>>,
    exclude: ExclusionMatcher,
    cancel: CancelToken,
) {
    loop {
        if cancel.is_cancelled() {
            drain_and_finish(&dir_rx, &inflight);
            return;
        }

        match dir_rx.recv_timeout(POLL_INTERVAL) {
            Ok(dir) => {
                process_dir(&dir, &dir_tx, &file_tx, &stats, &inflight, &errors, &exclude, &cancel);
                if inflight.fetch_sub(1, Ordering::SeqCst) - 1 <= 0 {
                    return;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if inflight.load(Ordering::SeqCst) <= 0 {
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn drain_and_finish(dir_rx: &crossbeam_channel::Receiver<PathBuf>, inflight: &AtomicI64) {
    while dir_rx.try_recv().is_ok() {
        inflight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[allow(clippy::too_many_arguments)]
fn process_dir(
    dir: &Path,
    dir_tx: &Sender<PathBuf>,
    file_tx: &Sender<(PathBuf, Option<u64>)>,
    stats: &ScanStats,
    inflight: &AtomicI64,
    errors: &std::sync::Mutex<Vec<ScanErrorRecord>>,
    exclude: &ExclusionMatcher,
    cancel: &CancelToken,
) {
    stats.dirs_scanned.fetch_add(1, Ordering::Relaxed);

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            errors.lock().unwrap().push(ScanErrorRecord {
                path: dir.to_path_buf(),
                reason: e.to_string(),
            });
            return;
        }
    };

    for entry in entries {
        if cancel.is_cancelled() {
            return;
        }

        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                errors.lock().unwrap().push(ScanErrorRecord {
                    path: dir.to_path_buf(),
                    reason: e.to_string(),
                });
                continue;
            }
        };

        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if exclude.matches_name(&name) || exclude.matches_path(&path) {
            continue;
        }

        let file_type = match entry.file_type() {
            Ok(ft) => ft,
            Err(e) => {
                errors.lock().unwrap().push(ScanErrorRecord {
                    path: path.clone(),
                    reason: e.to_string(),
                });
                continue;
            }
        };

        if file_type.is_dir() {
            inflight.fetch_add(1, Ordering::SeqCst);
            if dir_tx.send(path).is_err() {
                inflight.fetch_sub(1, Ordering::SeqCst);
            }
        } else if file_type.is_symlink() {
            // Symlinks to directories are not followed; symlinks to files
            // are treated as files using the target's metadata.
            match std::fs::metadata(&path) {
                Ok(meta) if meta.is_dir() => {}
                Ok(meta) => {
                    inflight.fetch_add(1, Ordering::SeqCst);
                    if file_tx.send((path, Some(meta.len()))).is_err() {
                        inflight.fetch_sub(1, Ordering::SeqCst);
                    }
                }
                Err(_) => {
                    // Broken symlink: not an error worth recording, just skip.
                }
            }
        } else {
            let size_hint = entry.metadata().ok().map(|m| m.len());
            inflight.fetch_add(1, Ordering::SeqCst);
            if file_tx.send((path, size_hint)).is_err() {
                inflight.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

fn file_worker(
    file_rx: crossbeam_channel::Receiver<(PathBuf, Option<u64>)>,
    record_tx: Sender<FileRecord>,
    stats: Arc<ScanStats>,
    inflight: Arc<AtomicI64>,
    errors: Arc<std::sync::Mutex<Vec<ScanErrorRecord>>>,
    min_size: u64,
    cancel: CancelToken,
) {
    loop {
        if cancel.is_cancelled() {
            while file_rx.try_recv().is_ok() {
                inflight.fetch_sub(1, Ordering::SeqCst);
            }
            return;
        }

        match file_rx.recv_timeout(POLL_INTERVAL) {
            Ok((path, size_hint)) => {
                // The directory worker already skipped clearly-too-small
                // dirents when it had a cheap size; still need an exact
                // stat for files whose dirent didn't expose a size.
                if let Some(hint) = size_hint {
                    if hint < min_size {
                        stats.files_scanned.fetch_add(1, Ordering::Relaxed);
                        finish_item(&inflight);
                        continue;
                    }
                }

                stats.files_scanned.fetch_add(1, Ordering::Relaxed);
                match stat_record(&path) {
                    Ok(record) if record.size >= min_size => {
                        stats.files_matched.fetch_add(1, Ordering::Relaxed);
                        if record_tx.send(record).is_err() {
                            debug!(path = %path.display(), "record channel closed, dropping");
                        }
                    }
                    Ok(_) => {}
                    Err(reason) => {
                        errors.lock().unwrap().push(ScanErrorRecord {
                            path: path.clone(),
                            reason,
                        });
                    }
                }
                finish_item(&inflight);
            }
            Err(RecvTimeoutError::Timeout) => {
                if inflight.load(Ordering::SeqCst) <= 0 {
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn finish_item(inflight: &AtomicI64) {
    inflight.fetch_sub(1, Ordering::SeqCst);
}

fn stat_record(path: &Path) -> Result<FileRecord, String> {
    let meta = std::fs::metadata(path).map_err(|e| e.to_string())?;
    let modified = meta.modified().map_err(|e| e.to_string())?;
    let created = meta.created().ok();
    let mode = meta.permissions().mode();
    let owner = ids::username(meta.uid());
    let group = ids::groupname(meta.gid());

    Ok(FileRecord {
        path: path.to_path_buf(),
        size: meta.len(),
        modified,
        created,
        mode,
        owner,
        group,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn write_file(path: &Path, size: usize) {
        fs::write(path, vec![b'x'; size]).unwrap();
    }

    #[test]
    fn scans_and_applies_min_size_and_exclusions() {
        let dir = tempdir().unwrap();
        let root = dir.path();

        write_file(&root.join("a.bin"), 120 * 1024 * 1024);
        write_file(&root.join("b.txt"), 1024);
        fs::create_dir(root.join("sub")).unwrap();
        write_file(&root.join("sub/c.bin"), 300 * 1024 * 1024);
        write_file(&root.join("sub/d.bin"), 50 * 1024 * 1024);
        fs::create_dir(root.join("excluded")).unwrap();
        write_file(&root.join("excluded/huge.bin"), 1024 * 1024 * 1024);

        let exclude = ExclusionMatcher::compile(["**/excluded/**"]).unwrap();
        let opts = ScanOptions {
            root: root.to_path_buf(),
            min_size: 100 * 1024 * 1024,
            exclude,
            dir_workers: 2,
            file_workers: 2,
        };

        let records = Mutex::new(Vec::new());
        let outcome =
            scan_streaming(opts, CancelToken::new(), |r| records.lock().unwrap().push(r)).unwrap();

        let mut records = records.into_inner().unwrap();
        records.sort_by(|a, b| b.size.cmp(&a.size));
        let names: Vec<_> = records
            .iter()
            .map(|r| r.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["c.bin", "a.bin"]);
        assert_eq!(outcome.errors.len(), 0);
        assert!(!outcome.stats.interrupted);
        assert_eq!(outcome.stats.dirs_scanned, 3);
    }

    #[test]
    fn nonexistent_root_is_fatal() {
        let opts = ScanOptions::new(PathBuf::from("/does/not/exist/at/all"), 0);
        let err = scan(opts, CancelToken::new()).unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[test]
    fn root_that_is_a_file_is_fatal() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("not_a_dir");
        write_file(&file_path, 10);
        let opts = ScanOptions::new(file_path, 0);
        let err = scan(opts, CancelToken::new()).unwrap_err();
        assert!(matches!(err, CoreError::NotADirectory(_)));
    }

    #[test]
    fn cancellation_stops_emission_and_sets_interrupted() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        for i in 0..50 {
            write_file(&root.join(format!("f{i}.bin")), 1024 * 1024);
        }

        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = scan_streaming(
            ScanOptions::new(root.to_path_buf(), 0),
            cancel,
            |_| panic!("no records should be emitted after immediate cancellation"),
        )
        .unwrap();
        assert!(outcome.stats.interrupted);
    }

    #[test]
    fn permission_denied_directory_is_recorded_not_fatal() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let locked = root.join("locked");
        fs::create_dir(&locked).unwrap();
        write_file(&root.join("visible.bin"), 10);

        let mut perms = fs::metadata(&locked).unwrap().permissions();
        perms.set_mode(0o000);
        fs::set_permissions(&locked, perms).unwrap();

        let outcome = scan(ScanOptions::new(root.to_path_buf(), 0), CancelToken::new());

        // Restore permissions so tempdir cleanup can remove it.
        let mut perms = fs::metadata(&locked).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&locked, perms).unwrap();

        let outcome = outcome.unwrap();
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].path, locked);
    }
}
