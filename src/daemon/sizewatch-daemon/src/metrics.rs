//! Metrics collection and reporting.
//!
//! Atomic counters back the snapshot returned to `GetDaemonStatus`; the same
//! events are also pushed into the `metrics` facade so a Prometheus scrape
//! sees them when `config.server.enable_metrics` turns the exporter on.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use sizewatch_core::ChangeKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Process-wide metrics collector. One instance lives for the life of the
/// daemon, shared behind an `Arc`.
pub struct MetricsCollector {
    start_time: Instant,
    scans_started: AtomicU64,
    scans_completed: AtomicU64,
    files_indexed: AtomicU64,
    watcher_events: AtomicU64,
    subscription_drops: AtomicU64,
    subscription_cancellations: AtomicU64,
    rpc_calls: AtomicU64,
    rpc_errors: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        MetricsCollector {
            start_time: Instant::now(),
            scans_started: AtomicU64::new(0),
            scans_completed: AtomicU64::new(0),
            files_indexed: AtomicU64::new(0),
            watcher_events: AtomicU64::new(0),
            subscription_drops: AtomicU64::new(0),
            subscription_cancellations: AtomicU64::new(0),
            rpc_calls: AtomicU64::new(0),
            rpc_errors: AtomicU64::new(0),
        }
    }

    /// Start the Prometheus exporter on `addr`. Only called when
    /// `config.server.enable_metrics` is set.
    pub fn install_exporter(addr: SocketAddr) -> anyhow::Result<()> {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;
        Ok(())
    }

    pub fn scan_started(&self) {
        self.scans_started.fetch_add(1, Ordering::Relaxed);
        counter!("sizewatch_scans_started_total").increment(1);
    }

    pub fn scan_completed(&self, files_matched: u64, duration: Duration) {
        self.scans_completed.fetch_add(1, Ordering::Relaxed);
        self.files_indexed.fetch_add(files_matched, Ordering::Relaxed);
        counter!("sizewatch_scans_completed_total").increment(1);
        counter!("sizewatch_files_indexed_total").increment(files_matched);
        histogram!("sizewatch_scan_duration_seconds").record(duration.as_secs_f64());
    }

    pub fn watcher_event(&self, kind: ChangeKind) {
        self.watcher_events.fetch_add(1, Ordering::Relaxed);
        let label = match kind {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Removed => "removed",
            ChangeKind::Renamed => "renamed",
        };
        counter!("sizewatch_watcher_events_total", "type" => label).increment(1);
    }

    pub fn resync_required(&self) {
        counter!("sizewatch_watcher_resync_total").increment(1);
    }

    pub fn subscription_drop(&self) {
        self.subscription_drops.fetch_add(1, Ordering::Relaxed);
        counter!("sizewatch_subscription_drops_total").increment(1);
    }

    pub fn subscription_cancelled_lagging(&self) {
        self.subscription_cancellations.fetch_add(1, Ordering::Relaxed);
        counter!("sizewatch_subscription_cancellations_total").increment(1);
    }

    pub fn rpc_call(&self, rpc: &'static str, status: &'static str) {
        self.rpc_calls.fetch_add(1, Ordering::Relaxed);
        if status != "ok" {
            self.rpc_errors.fetch_add(1, Ordering::Relaxed);
        }
        counter!("sizewatch_rpc_calls_total", "rpc" => rpc, "status" => status).increment(1);
    }

    pub fn set_watched_roots(&self, count: usize) {
        gauge!("sizewatch_watched_roots").set(count as f64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime: self.start_time.elapsed(),
            scans_started: self.scans_started.load(Ordering::Relaxed),
            scans_completed: self.scans_completed.load(Ordering::Relaxed),
            files_indexed: self.files_indexed.load(Ordering::Relaxed),
            watcher_events: self.watcher_events.load(Ordering::Relaxed),
            subscription_drops: self.subscription_drops.load(Ordering::Relaxed),
            subscription_cancellations: self.subscription_cancellations.load(Ordering::Relaxed),
            rpc_calls: self.rpc_calls.load(Ordering::Relaxed),
            rpc_errors: self.rpc_errors.load(Ordering::Relaxed),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub uptime: Duration,
    pub scans_started: u64,
    pub scans_completed: u64,
    pub files_indexed: u64,
    pub watcher_events: u64,
    pub subscription_drops: u64,
    pub subscription_cancellations: u64,
    pub rpc_calls: u64,
    pub rpc_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let collector = MetricsCollector::new();
        collector.scan_started();
        collector.scan_completed(42, Duration::from_millis(5));
        collector.watcher_event(ChangeKind::Modified);
        collector.rpc_call("GetLargeFiles", "ok");
        collector.rpc_call("GetTree", "not_found");

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.scans_started, 1);
        assert_eq!(snapshot.scans_completed, 1);
        assert_eq!(snapshot.files_indexed, 42);
        assert_eq!(snapshot.watcher_events, 1);
        assert_eq!(snapshot.rpc_calls, 2);
        assert_eq!(snapshot.rpc_errors, 1);
    }

    #[test]
    fn lag_accounting_is_tracked_separately_from_drops() {
        let collector = MetricsCollector::new();
        collector.subscription_drop();
        collector.subscription_drop();
        collector.subscription_cancelled_lagging();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.subscription_drops, 2);
        assert_eq!(snapshot.subscription_cancellations, 1);
    }
}
