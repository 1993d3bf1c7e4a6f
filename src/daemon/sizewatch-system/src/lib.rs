//! Scan engine, watcher adapter, index store, and event dispatcher: the
//! stateful half of sizewatch, sitting between the filesystem and the
//! daemon's RPC surface.

pub mod dispatch;
pub mod ids;
pub mod index;
pub mod scan;
pub mod watcher;

pub use dispatch::{DispatchedEvent, EventDispatcher, Subscription};
pub use index::{Index, IndexManager};
pub use scan::{
    scan, scan_streaming, scan_streaming_with_stats, CancelToken, ScanOptions, ScanOutcome, ScanStats,
    ScanStatsSnapshot,
};
pub use watcher::{watch, WatchSignal, WatcherAdapter, DEFAULT_DEBOUNCE};
