//! Index lifecycle types shared between the index store and the RPC layer.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::SystemTime;

/// The lifecycle state of a single root's index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexState {
    /// No scan has ever completed for this root.
    NotIndexed,
    /// A scan is currently in progress; reads are served from the last
    /// completed generation, if any.
    Indexing,
    /// The index reflects the last completed scan and the watcher has not
    /// reported loss since.
    Ready,
    /// The watcher signalled `RESYNC_REQUIRED` (or was never able to
    /// start) and the index may no longer match the filesystem.
    Stale,
}

/// A point-in-time summary of a root's index, returned by `GetIndexStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStatus {
    pub root: PathBuf,
    pub state: IndexState,
    pub file_count: u64,
    pub total_bytes: u64,
    pub last_scan_started: Option<SystemTime>,
    pub last_scan_completed: Option<SystemTime>,
    /// Number of `ScanErrorRecord`s accumulated during the last scan.
    pub scan_error_count: u64,
    pub watching: bool,
    /// Monotonic estimate of scan completion while `state == Indexing`;
    /// meaningless (reported as `0.0`) in any other state. Estimation is
    /// approximate by design (spec.md §4.5).
    pub progress: f32,
}

impl IndexStatus {
    pub fn not_indexed(root: PathBuf) -> Self {
        IndexStatus {
            root,
            state: IndexState::NotIndexed,
            file_count: 0,
            total_bytes: 0,
            last_scan_started: None,
            last_scan_completed: None,
            scan_error_count: 0,
            watching: false,
            progress: 0.0,
        }
    }
}
