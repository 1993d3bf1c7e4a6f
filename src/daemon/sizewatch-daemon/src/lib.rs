//! sizewatch daemon library: configuration, the daemon supervisor and
//! in-process orchestrator, metrics, and the Unix-socket RPC surface
//! (server and client sides).

pub mod config;
pub mod daemon;
pub mod metrics;
pub mod rpc;

pub use config::DaemonConfig;
pub use daemon::{DaemonSupervisor, Orchestrator, StatusFile};
pub use metrics::MetricsCollector;
