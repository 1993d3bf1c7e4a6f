//! Daemon supervisor: the bit-exact startup/shutdown sequence from spec.md
//! §4.8, plus the in-process [`Orchestrator`] that ties the index store,
//! watcher adapters, event dispatcher, and metrics together for the RPC
//! layer to drive.

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sizewatch_core::{CoreError, CoreResult, ExclusionMatcher, IndexState};
use sizewatch_system::{
    scan_streaming_with_stats, watch, CancelToken, EventDispatcher, Index, IndexManager, ScanOptions,
    ScanOutcome, ScanStats, WatchSignal, WatcherAdapter,
};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::DaemonConfig;
use crate::metrics::MetricsCollector;

/// Waits for either Ctrl+C or a `SIGTERM`, whichever comes first.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// `<data>/<app>.status` contents (spec.md §4.8, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusFile {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Owns the startup sequence: data directory, PID file, status file, and
/// the bound socket. `bind` performs steps 1-5 of spec.md §4.8; the caller
/// initializes the index store and RPC server (step 6) and then calls
/// `mark_ready` (step 7).
pub struct DaemonSupervisor {
    config: DaemonConfig,
}

impl DaemonSupervisor {
    pub fn new(config: DaemonConfig) -> Self {
        DaemonSupervisor { config }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Steps 1-5: create the data directory, refuse to start if another
    /// instance is alive, bind the socket at `0600`, and write the PID file.
    ///
    /// Returns a blocking `std` listener so this can run before a Tokio
    /// runtime exists (and so it can be exercised from plain `#[test]`s);
    /// the caller converts it with `UnixListener::from_std` after calling
    /// `set_nonblocking(true)`.
    pub fn bind(&self) -> Result<UnixListener> {
        std::fs::create_dir_all(&self.config.paths.data_dir)
            .with_context(|| format!("creating data dir {}", self.config.paths.data_dir.display()))?;
        std::fs::set_permissions(&self.config.paths.data_dir, std::fs::Permissions::from_mode(0o755))?;
        std::fs::create_dir_all(&self.config.paths.state_dir)
            .with_context(|| format!("creating state dir {}", self.config.paths.state_dir.display()))?;

        if let Some(pid) = self.read_live_pid() {
            bail!("sizewatch daemon already running (pid {pid})");
        }

        self.write_status(&StatusFile {
            status: "starting".into(),
            pid: Some(std::process::id()),
            error: None,
        })?;

        let socket_path = self.config.socket_path();
        if socket_path.exists() {
            std::fs::remove_file(&socket_path).ok();
        }

        let listener = match UnixListener::bind(&socket_path) {
            Ok(l) => l,
            Err(e) => {
                self.write_status(&StatusFile {
                    status: "error".into(),
                    pid: None,
                    error: Some(e.to_string()),
                })?;
                bail!("failed to bind socket {}: {e}", socket_path.display());
            }
        };
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;

        self.write_pid(std::process::id())?;
        Ok(listener)
    }

    /// Step 7.
    pub fn mark_ready(&self) -> Result<()> {
        self.write_status(&StatusFile {
            status: "ready".into(),
            pid: Some(std::process::id()),
            error: None,
        })
    }

    /// Remove the PID file and leave the status file as `ready` (spec.md
    /// §4.8: it is overwritten on the next start, not rewritten on exit).
    pub fn shutdown(&self) -> Result<()> {
        let pid_path = self.config.pid_path();
        if pid_path.exists() {
            std::fs::remove_file(&pid_path).with_context(|| format!("removing {}", pid_path.display()))?;
        }
        Ok(())
    }

    fn read_live_pid(&self) -> Option<u32> {
        let contents = std::fs::read_to_string(self.config.pid_path()).ok()?;
        let pid: u32 = contents.trim().parse().ok()?;
        is_process_alive(pid).then_some(pid)
    }

    fn write_status(&self, status: &StatusFile) -> Result<()> {
        let body = serde_json::to_string(status)?;
        write_atomic(&self.config.status_path(), body.as_bytes())
    }

    fn write_pid(&self, pid: u32) -> Result<()> {
        write_atomic(&self.config.pid_path(), format!("{pid}\n").as_bytes())
    }
}

fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, contents).with_context(|| format!("writing {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

struct WatchGuard {
    _adapter: WatcherAdapter,
    task: JoinHandle<()>,
}

/// Ties the index store, watcher adapters, and event dispatcher together
/// for the RPC handlers: every RPC that names a root goes through
/// `ensure_indexed`, which seeds the index on first reference and keeps a
/// watcher running for as long as the root is tracked.
pub struct Orchestrator {
    config: DaemonConfig,
    indexes: IndexManager,
    dispatcher: EventDispatcher,
    metrics: Arc<MetricsCollector>,
    watchers: DashMap<PathBuf, WatchGuard>,
    started_at: Instant,
}

impl Orchestrator {
    pub fn new(config: DaemonConfig, metrics: Arc<MetricsCollector>) -> Arc<Self> {
        let dispatcher = EventDispatcher::with_limits(
            config.subscriptions.buffer_size,
            config.subscriptions.lag_cancel_threshold,
        );
        Arc::new(Orchestrator {
            config,
            indexes: IndexManager::new(),
            dispatcher,
            metrics,
            watchers: DashMap::new(),
            started_at: Instant::now(),
        })
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn indexes(&self) -> &IndexManager {
        &self.indexes
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    pub fn default_exclude(&self) -> ExclusionMatcher {
        ExclusionMatcher::compile_lenient(&self.config.indexing.default_excludes)
    }

    /// `ensure(root, cfg)` + `trigger(root, force)` from spec.md §4.5,
    /// folded into one call: returns the tracked index, scanning it first
    /// if it has never been indexed (or is STALE) or the caller forces it,
    /// and making sure a watcher is running for it either way.
    pub async fn ensure_indexed(self: &Arc<Self>, root: PathBuf, force: bool) -> CoreResult<Arc<Index>> {
        let threshold = self.config.indexing.default_threshold_bytes;
        let exclude = self.default_exclude();
        let index = self.indexes.ensure(root.clone(), threshold, exclude.clone())?;

        let needs_scan = force || matches!(index.status().state, IndexState::NotIndexed | IndexState::Stale);
        if needs_scan {
            index.begin_indexing(force)?;
            self.run_scan(Arc::clone(&index), root.clone(), threshold, exclude).await?;
        }

        self.ensure_watching(Arc::clone(&index), root);
        Ok(index)
    }

    /// `TriggerIndex(root, force)` from spec.md §4.7: unlike
    /// `ensure_indexed`, this always scans when the index is idle and
    /// reports `BUSY` as `started: false` rather than an RPC error when one
    /// is already in flight and `force` wasn't set.
    pub async fn trigger(self: &Arc<Self>, root: PathBuf, force: bool) -> CoreResult<(bool, String)> {
        let threshold = self.config.indexing.default_threshold_bytes;
        let exclude = self.default_exclude();
        let index = self.indexes.ensure(root.clone(), threshold, exclude.clone())?;

        match index.begin_indexing(force) {
            Ok(_) => {
                self.run_scan(Arc::clone(&index), root.clone(), threshold, exclude).await?;
                self.ensure_watching(Arc::clone(&index), root);
                Ok((true, "indexing complete".to_string()))
            }
            Err(CoreError::Busy(_)) => Ok((false, "index is already indexing".to_string())),
            Err(e) => Err(e),
        }
    }

    async fn run_scan(
        &self,
        index: Arc<Index>,
        root: PathBuf,
        threshold: u64,
        exclude: ExclusionMatcher,
    ) -> CoreResult<()> {
        self.metrics.scan_started();
        let started = Instant::now();
        let opts = ScanOptions {
            root,
            min_size: threshold,
            exclude,
            dir_workers: self.config.dir_workers(),
            file_workers: self.config.file_workers(),
        };
        let cancel = CancelToken::new();
        let stats = Arc::new(ScanStats::default());

        // Estimate against the file count from the last completed scan, if
        // any; a root indexed for the first time just climbs slowly until
        // `apply_scan_outcome` snaps progress to 1.0.
        let est_total = index.status().file_count.max(1);
        let progress_index = Arc::clone(&index);
        let progress_stats = Arc::clone(&stats);
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(250));
        let progress_task = tokio::spawn(async move {
            loop {
                ticker.tick().await;
                let scanned = progress_stats.files_scanned.load(std::sync::atomic::Ordering::Relaxed);
                let fraction = (scanned as f64 / est_total as f64).min(0.95) as f32;
                progress_index.set_progress(fraction);
            }
        });

        let scan_stats = Arc::clone(&stats);
        let outcome: CoreResult<ScanOutcome> = tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            let mut outcome = scan_streaming_with_stats(opts, cancel, scan_stats, |record| files.push(record))?;
            outcome.files = files;
            Ok(outcome)
        })
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?;
        progress_task.abort();
        let outcome = outcome?;
        let matched = outcome.stats.files_matched;
        index.apply_scan_outcome(outcome);
        self.metrics.scan_completed(matched, started.elapsed());
        Ok(())
    }

    fn ensure_watching(self: &Arc<Self>, index: Arc<Index>, root: PathBuf) {
        if self.watchers.contains_key(&root) {
            return;
        }

        let (adapter, mut rx) = match watch(root.clone(), self.config.debounce()) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "failed to start watcher for root");
                return;
            }
        };
        index.mark_watching(true);

        let orch = Arc::clone(self);
        let task_index = Arc::clone(&index);
        let task_root = root.clone();
        let task = tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                match signal {
                    WatchSignal::Change(event) => {
                        orch.metrics.watcher_event(event.kind);
                        if let Some(forwarded) = task_index.apply_event(&event) {
                            orch.dispatcher.publish(&task_root, forwarded);
                        }
                    }
                    WatchSignal::ResyncRequired => {
                        orch.metrics.resync_required();
                        warn!(root = %task_root.display(), "watcher requested full resync");
                        task_index.mark_stale();
                        let threshold = task_index.threshold();
                        let exclude = task_index.exclude();
                        if task_index.begin_indexing(true).is_ok() {
                            if let Err(e) = orch
                                .run_scan(Arc::clone(&task_index), task_root.clone(), threshold, exclude)
                                .await
                            {
                                warn!(root = %task_root.display(), error = %e, "resync scan failed");
                            }
                        }
                    }
                }
            }
        });

        self.watchers.insert(root, WatchGuard { _adapter: adapter, task });
        self.metrics.set_watched_roots(self.watchers.len());
    }

    pub fn clear(&self, path: Option<&Path>) -> u64 {
        self.indexes.clear(path)
    }

    pub fn watched_roots(&self) -> Vec<PathBuf> {
        self.indexes.roots()
    }

    pub fn cache_bytes_estimate(&self) -> u64 {
        self.indexes
            .roots()
            .iter()
            .filter_map(|root| self.indexes.get(root).ok())
            .map(|index| index.status().total_bytes)
            .sum()
    }

    pub fn total_files(&self) -> u64 {
        self.indexes
            .roots()
            .iter()
            .filter_map(|root| self.indexes.get(root).ok())
            .map(|index| index.status().file_count)
            .sum()
    }

    /// Abort every watcher task. Does not touch the PID/status/socket files
    /// — that's [`DaemonSupervisor::shutdown`]'s job.
    pub fn shutdown(&self) {
        for entry in self.watchers.iter() {
            entry.task.abort();
        }
    }
}

pub fn process_memory_bytes() -> u64 {
    use sysinfo::{Pid, System};
    let pid = Pid::from_u32(std::process::id());
    let mut system = System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).map(|p| p.memory()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(dir: &Path) -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.paths.data_dir = dir.to_path_buf();
        config.paths.state_dir = dir.to_path_buf();
        config
    }

    #[test]
    fn bind_creates_dir_pid_and_status_files() {
        let dir = tempdir().unwrap();
        let supervisor = DaemonSupervisor::new(test_config(dir.path()));
        let _listener = supervisor.bind().unwrap();

        assert!(supervisor.config().pid_path().exists());
        assert!(supervisor.config().status_path().exists());
        assert!(supervisor.config().socket_path().exists());

        let status: StatusFile =
            serde_json::from_str(&std::fs::read_to_string(supervisor.config().status_path()).unwrap()).unwrap();
        assert_eq!(status.status, "starting");

        supervisor.mark_ready().unwrap();
        let status: StatusFile =
            serde_json::from_str(&std::fs::read_to_string(supervisor.config().status_path()).unwrap()).unwrap();
        assert_eq!(status.status, "ready");
    }

    #[test]
    fn socket_is_created_with_owner_only_permissions() {
        let dir = tempdir().unwrap();
        let supervisor = DaemonSupervisor::new(test_config(dir.path()));
        let _listener = supervisor.bind().unwrap();
        let mode = std::fs::metadata(supervisor.config().socket_path())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn second_instance_refuses_to_start_while_first_is_alive() {
        let dir = tempdir().unwrap();
        let supervisor_a = DaemonSupervisor::new(test_config(dir.path()));
        let _listener = supervisor_a.bind().unwrap();

        // Our own PID is always "alive," standing in for the live first
        // instance without needing to fork a real second process.
        let supervisor_b = DaemonSupervisor::new(test_config(dir.path()));
        let err = supervisor_b.bind().unwrap_err();
        assert!(err.to_string().contains("already running"));
    }

    #[test]
    fn shutdown_removes_pid_file_but_leaves_status() {
        let dir = tempdir().unwrap();
        let supervisor = DaemonSupervisor::new(test_config(dir.path()));
        let _listener = supervisor.bind().unwrap();
        supervisor.mark_ready().unwrap();

        supervisor.shutdown().unwrap();
        assert!(!supervisor.config().pid_path().exists());
        assert!(supervisor.config().status_path().exists());
    }
}
