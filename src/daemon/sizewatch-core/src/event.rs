//! Filesystem change events emitted by the watcher and forwarded to
//! subscribers by the event dispatcher.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::SystemTime;

/// The kind of change a [`ChangeEvent`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
    /// The path moved; `from` is carried on the event as `Some`.
    Renamed,
}

/// A single normalized filesystem change, already coalesced and debounced
/// by the watcher adapter before it reaches the index store or a
/// subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
    /// Populated only for `ChangeKind::Renamed`.
    pub from: Option<PathBuf>,
    pub size: Option<u64>,
    pub observed_at: SystemTime,
    /// `path`'s parent directory. `WatchTree` subscribers use this to patch
    /// their materialized tree without a full re-walk; `WatchLargeFiles`
    /// subscribers ignore it.
    pub parent: Option<PathBuf>,
}

impl ChangeEvent {
    pub fn created(path: PathBuf, size: u64, observed_at: SystemTime) -> Self {
        let parent = path.parent().map(|p| p.to_path_buf());
        ChangeEvent {
            kind: ChangeKind::Created,
            path,
            from: None,
            size: Some(size),
            observed_at,
            parent,
        }
    }

    pub fn modified(path: PathBuf, size: u64, observed_at: SystemTime) -> Self {
        let parent = path.parent().map(|p| p.to_path_buf());
        ChangeEvent {
            kind: ChangeKind::Modified,
            path,
            from: None,
            size: Some(size),
            observed_at,
            parent,
        }
    }

    pub fn removed(path: PathBuf, observed_at: SystemTime) -> Self {
        let parent = path.parent().map(|p| p.to_path_buf());
        ChangeEvent {
            kind: ChangeKind::Removed,
            path,
            from: None,
            size: None,
            observed_at,
            parent,
        }
    }

    pub fn renamed(from: PathBuf, to: PathBuf, size: Option<u64>, observed_at: SystemTime) -> Self {
        let parent = to.parent().map(|p| p.to_path_buf());
        ChangeEvent {
            kind: ChangeKind::Renamed,
            path: to,
            from: Some(from),
            size,
            observed_at,
            parent,
        }
    }
}
