//! Daemon configuration: data/state directories, indexing defaults, RPC and
//! subscription tuning, and logging. Loaded from an optional TOML file with
//! CLI overrides layered on top.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const APP_NAME: &str = "sizewatch";

/// Top-level daemon configuration. `Default` gives sane values for local
/// runs and tests; the CLI resolves `data_dir`/`state_dir` to concrete XDG
/// paths before handing this to the daemon (spec.md §6: the core treats
/// these as opaque, caller-supplied paths).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub paths: PathsConfig,
    pub indexing: IndexingConfig,
    pub subscriptions: SubscriptionConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Holds the socket, PID file, and status file.
    pub data_dir: PathBuf,
    /// Holds the log file.
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    pub default_threshold_bytes: u64,
    pub default_excludes: Vec<String>,
    /// `0` means auto-detect from available parallelism.
    pub dir_workers: usize,
    pub file_workers: usize,
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub buffer_size: usize,
    pub lag_cancel_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub unary_deadline_ms: u64,
    pub shutdown_grace_ms: u64,
    pub enable_metrics: bool,
    pub metrics_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive, e.g. `"info"` or `"sizewatch_daemon=debug"`.
    pub level: String,
    /// `"pretty"` or `"json"`.
    pub format: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            paths: PathsConfig {
                data_dir: PathBuf::from("/tmp/sizewatch"),
                state_dir: PathBuf::from("/tmp/sizewatch"),
            },
            indexing: IndexingConfig::default(),
            subscriptions: SubscriptionConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for IndexingConfig {
    fn default() -> Self {
        IndexingConfig {
            default_threshold_bytes: 100 * 1024 * 1024,
            default_excludes: vec![
                "**/.git/**".to_string(),
                "**/node_modules/**".to_string(),
                "**/target/**".to_string(),
            ],
            dir_workers: 0,
            file_workers: 0,
            debounce_ms: 200,
        }
    }
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        SubscriptionConfig {
            buffer_size: 100,
            lag_cancel_threshold: 256,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            unary_deadline_ms: 5_000,
            shutdown_grace_ms: 5_000,
            enable_metrics: false,
            metrics_port: 9090,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl DaemonConfig {
    pub fn socket_path(&self) -> PathBuf {
        self.paths.data_dir.join(format!("{APP_NAME}.sock"))
    }

    pub fn pid_path(&self) -> PathBuf {
        self.paths.data_dir.join(format!("{APP_NAME}.pid"))
    }

    pub fn status_path(&self) -> PathBuf {
        self.paths.data_dir.join(format!("{APP_NAME}.status"))
    }

    pub fn log_path(&self) -> PathBuf {
        self.paths.state_dir.join(format!("{APP_NAME}.log"))
    }

    pub fn unary_deadline(&self) -> Duration {
        Duration::from_millis(self.server.unary_deadline_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.server.shutdown_grace_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.indexing.debounce_ms)
    }

    pub fn dir_workers(&self) -> usize {
        if self.indexing.dir_workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.indexing.dir_workers
        }
    }

    pub fn file_workers(&self) -> usize {
        if self.indexing.file_workers == 0 {
            num_cpus::get().max(1) * 2
        } else {
            self.indexing.file_workers
        }
    }

    /// Load a complete config document from a TOML file via the `config`
    /// crate's layered source builder (a single file source here; the CLI
    /// is the only other layer, applied by the caller after this returns).
    pub fn load_from_file(path: &std::path::Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .with_context(|| format!("reading config file {}", path.display()))?;
        settings
            .try_deserialize()
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn load_or_default(path: Option<&std::path::Path>) -> Result<Self> {
        match path {
            Some(path) if path.exists() => Self::load_from_file(path),
            _ => Ok(DaemonConfig::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let config = DaemonConfig::default();
        assert!(config.dir_workers() >= 1);
        assert!(config.file_workers() >= 1);
        assert_eq!(config.socket_path().extension().unwrap(), "sock");
    }

    #[test]
    fn round_trips_through_toml() {
        let config = DaemonConfig::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: DaemonConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.indexing.default_threshold_bytes, config.indexing.default_threshold_bytes);
        assert_eq!(parsed.subscriptions.buffer_size, config.subscriptions.buffer_size);
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let config = DaemonConfig::load_or_default(Some(std::path::Path::new("/no/such/file.toml"))).unwrap();
        assert_eq!(config.server.metrics_port, DaemonConfig::default().server.metrics_port);
    }

    #[test]
    fn explicit_file_loads_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sizewatch.toml");
        std::fs::write(
            &path,
            r#"
[paths]
data_dir = "/var/lib/sizewatch"
state_dir = "/var/lib/sizewatch"

[indexing]
default_threshold_bytes = 52428800
default_excludes = []
dir_workers = 4
file_workers = 8
debounce_ms = 200

[subscriptions]
buffer_size = 100
lag_cancel_threshold = 256

[server]
unary_deadline_ms = 5000
shutdown_grace_ms = 5000
enable_metrics = true
metrics_port = 9100

[logging]
level = "debug"
format = "json"
"#,
        )
        .unwrap();

        let config = DaemonConfig::load_or_default(Some(&path)).unwrap();
        assert_eq!(config.indexing.default_threshold_bytes, 52428800);
        assert!(config.server.enable_metrics);
        assert_eq!(config.logging.level, "debug");
    }
}
