//! sizewatch - resident disk-space index daemon and CLI.
//!
//! `start`/`stop`/`status` drive the daemon supervisor; `scan` runs the
//! scan engine directly with no daemon involved; `index`/`ls`/`tree`/`watch`
//! talk to a running daemon over its Unix socket.

use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sizewatch_core::ExclusionMatcher;
use sizewatch_daemon::config::DaemonConfig;
use sizewatch_daemon::daemon::{shutdown_signal, DaemonSupervisor, Orchestrator};
use sizewatch_daemon::metrics::MetricsCollector;
use sizewatch_daemon::rpc::client::{wait_for_pid_file_removed, wait_for_ready, Client};
use sizewatch_daemon::rpc::protocol::{FilterParams, Request, Response};
use sizewatch_system::{scan, CancelToken, ScanOptions};

#[derive(Parser)]
#[command(name = "sizewatch")]
#[command(about = "Resident disk-space index daemon and client")]
#[command(version)]
struct Cli {
    /// Daemon data directory (socket, PID file, status file).
    #[arg(long, global = true, default_value = "/tmp/sizewatch")]
    data_dir: PathBuf,

    /// Daemon state directory (log file).
    #[arg(long, global = true, default_value = "/tmp/sizewatch")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon.
    Start(StartArgs),
    /// Stop the running daemon.
    Stop,
    /// Report whether the daemon is running and its current status.
    Status,
    /// Daemonless direct scan of a root.
    Scan(ScanArgs),
    /// Trigger (re-)indexing of a root on the running daemon.
    Index(IndexArgs),
    /// List large files under a root, via the running daemon.
    Ls(FilterArgs),
    /// Print the aggregated tree for a root, via the running daemon.
    Tree(FilterArgs),
    /// Stream change events for a root until interrupted.
    Watch(WatchArgs),
}

#[derive(Args)]
struct StartArgs {
    /// Run attached to this terminal instead of as a background daemon.
    #[arg(short, long)]
    foreground: bool,

    /// Optional TOML configuration file, layered under CLI overrides.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct ScanArgs {
    root: PathBuf,
    #[arg(long, default_value = "100M")]
    min_size: String,
    #[arg(long = "exclude")]
    exclude: Vec<String>,
}

#[derive(Args)]
struct IndexArgs {
    root: PathBuf,
    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct FilterArgs {
    root: PathBuf,
    #[arg(long, default_value = "0")]
    min_size: String,
    #[arg(long = "exclude")]
    exclude: Vec<String>,
    #[arg(long, default_value_t = 0)]
    limit: usize,
}

#[derive(Args)]
struct WatchArgs {
    root: PathBuf,
    /// Stream tree-patch events (`WatchTree`) instead of the flat feed.
    #[arg(long)]
    tree: bool,
    #[arg(long, default_value = "0")]
    min_size: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = match &cli.command {
        Commands::Start(args) if !args.foreground => {
            let log_path = cli.state_dir.join(format!("{}.log", sizewatch_daemon::config::APP_NAME));
            Some(init_tracing_with_file(&log_path))
        }
        _ => {
            init_tracing_stderr_only();
            None
        }
    };

    match cli.command {
        Commands::Start(args) => start_daemon(&cli.data_dir, &cli.state_dir, args).await,
        Commands::Stop => stop_daemon(&cli.data_dir).await,
        Commands::Status => show_status(&cli.data_dir).await,
        Commands::Scan(args) => run_scan(args).await,
        Commands::Index(args) => run_index(&cli.data_dir, args).await,
        Commands::Ls(args) => run_ls(&cli.data_dir, args).await,
        Commands::Tree(args) => run_tree(&cli.data_dir, args).await,
        Commands::Watch(args) => run_watch(&cli.data_dir, args).await,
    }
}

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// `--foreground` and every non-`start` subcommand: stderr only.
fn init_tracing_stderr_only() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// A backgrounded `start`: stderr plus the append-only log file from
/// spec.md §6. Returns the `WorkerGuard` the non-blocking file writer needs
/// kept alive for the life of the process.
fn init_tracing_with_file(log_path: &std::path::Path) -> tracing_appender::non_blocking::WorkerGuard {
    let dir = log_path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let file_name = log_path.file_name().unwrap_or_default();
    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
        .init();
    guard
}

fn resolve_config(data_dir: &std::path::Path, state_dir: &std::path::Path, config_path: Option<&std::path::Path>) -> Result<DaemonConfig> {
    let mut config = DaemonConfig::load_or_default(config_path)?;
    config.paths.data_dir = data_dir.to_path_buf();
    config.paths.state_dir = state_dir.to_path_buf();
    Ok(config)
}

/// `start`: without `--foreground`, this is the *client-side* helper from
/// spec.md §4.8 — spawn the daemon binary detached from this process group
/// and poll the socket/status file for up to 5s. With `--foreground`, this
/// process runs the supervisor's steps 1-7 itself and blocks until shutdown.
async fn start_daemon(data_dir: &std::path::Path, state_dir: &std::path::Path, args: StartArgs) -> Result<()> {
    if !args.foreground {
        return spawn_detached_and_wait(data_dir, state_dir, args.config.as_deref()).await;
    }
    run_daemon_foreground(data_dir, state_dir, args.config.as_deref()).await
}

/// Re-invokes this binary with `start --foreground` in a new session (so it
/// survives the parent exiting) and polls for readiness exactly as spec.md
/// §4.8's client-side `start` helper describes.
async fn spawn_detached_and_wait(
    data_dir: &std::path::Path,
    state_dir: &std::path::Path,
    config_path: Option<&std::path::Path>,
) -> Result<()> {
    let exe = std::env::current_exe().context("resolving own executable path")?;
    let mut command = std::process::Command::new(exe);
    command
        .arg("--data-dir")
        .arg(data_dir)
        .arg("--state-dir")
        .arg(state_dir)
        .arg("start")
        .arg("--foreground");
    if let Some(path) = config_path {
        command.arg("--config").arg(path);
    }
    command
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    unsafe {
        command.pre_exec(|| {
            // Detach from the parent's process group so a terminal close or
            // the parent exiting doesn't signal this process too.
            if libc::setsid() < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    command.spawn().context("spawning detached daemon process")?;

    let config = resolve_config(data_dir, state_dir, config_path)?;
    wait_for_ready(&config.socket_path(), &config.status_path(), Duration::from_secs(5)).await?;
    println!("daemon started");
    Ok(())
}

async fn run_daemon_foreground(
    data_dir: &std::path::Path,
    state_dir: &std::path::Path,
    config_path: Option<&std::path::Path>,
) -> Result<()> {
    let config = resolve_config(data_dir, state_dir, config_path)?;
    info!(data_dir = %config.paths.data_dir.display(), "starting sizewatch daemon");

    let supervisor = DaemonSupervisor::new(config.clone());
    let std_listener = supervisor.bind().context("daemon startup sequence failed")?;
    std_listener.set_nonblocking(true)?;
    let listener = tokio::net::UnixListener::from_std(std_listener)?;

    if config.server.enable_metrics {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.server.metrics_port));
        MetricsCollector::install_exporter(addr)?;
        info!(port = config.server.metrics_port, "metrics exporter listening");
    }

    let metrics = std::sync::Arc::new(MetricsCollector::new());
    let orchestrator = Orchestrator::new(config.clone(), metrics);
    let shutdown = sizewatch_daemon::rpc::server::ShutdownHandle::new();

    supervisor.mark_ready().context("writing ready status")?;
    info!(socket = %config.socket_path().display(), "daemon ready");

    let serve_orch = std::sync::Arc::clone(&orchestrator);
    let serve_shutdown = shutdown.clone();
    let server = tokio::spawn(sizewatch_daemon::rpc::serve(listener, serve_orch, serve_shutdown));

    tokio::select! {
        _ = shutdown_signal() => {
            info!("termination signal received, shutting down");
        }
        _ = server_completed(&shutdown) => {
            info!("shutdown RPC received");
        }
    }

    shutdown.trigger();
    orchestrator.shutdown();
    tokio::time::timeout(config.shutdown_grace(), server).await.ok();
    supervisor.shutdown().context("removing PID file")?;
    info!("daemon stopped");
    Ok(())
}

/// Resolves once the shutdown handle's broadcast channel has fired for any
/// reason, so the `select!` above treats a `Shutdown` RPC the same as a
/// host signal.
async fn server_completed(shutdown: &sizewatch_daemon::rpc::server::ShutdownHandle) {
    let mut rx = shutdown.subscribe();
    let _ = rx.recv().await;
}

/// `stop`: issue `Shutdown`, then poll for PID-file disappearance.
async fn stop_daemon(data_dir: &std::path::Path) -> Result<()> {
    let config = resolve_config(data_dir, data_dir, None)?;
    let mut client = Client::connect(&config.socket_path())
        .await
        .context("daemon does not appear to be running")?;
    client.shutdown().await?;
    wait_for_pid_file_removed(&config.pid_path(), Duration::from_secs(5)).await?;
    println!("daemon stopped");
    Ok(())
}

/// `status`: print the daemon's own view of itself via `GetDaemonStatus`.
async fn show_status(data_dir: &std::path::Path) -> Result<()> {
    let config = resolve_config(data_dir, data_dir, None)?;
    match Client::connect(&config.socket_path()).await {
        Ok(mut client) => {
            let status = client.get_daemon_status().await?;
            println!("running=true");
            println!("uptime_secs={}", status.uptime_secs);
            println!("memory_bytes={}", status.memory_bytes);
            println!("cache_bytes={}", status.cache_bytes);
            println!("total_files={}", status.total_files);
            println!("watched_paths={:?}", status.watched_paths);
        }
        Err(_) => {
            println!("running=false");
        }
    }
    Ok(())
}

/// `scan`: daemonless direct invocation of the scan engine, no RPC or
/// index store involved.
async fn run_scan(args: ScanArgs) -> Result<()> {
    let min_size = sizewatch_core::parse::parse_size(&args.min_size)
        .with_context(|| format!("invalid --min-size: {}", args.min_size))?;
    let exclude = ExclusionMatcher::compile(&args.exclude).context("invalid --exclude pattern")?;

    let opts = ScanOptions {
        root: args.root,
        min_size,
        exclude,
        dir_workers: num_cpus::get().max(1),
        file_workers: num_cpus::get().max(1) * 2,
    };

    let outcome = tokio::task::spawn_blocking(move || scan(opts, CancelToken::new())).await??;
    let mut files = outcome.files;
    files.sort_by(sizewatch_core::filter::size_descending);
    for record in &files {
        println!("{}\t{}", record.size, record.path.display());
    }
    eprintln!(
        "dirs_scanned={} files_scanned={} matched={} errors={} interrupted={}",
        outcome.stats.dirs_scanned,
        outcome.stats.files_scanned,
        outcome.stats.files_matched,
        outcome.errors.len(),
        outcome.stats.interrupted,
    );
    for err in &outcome.errors {
        debug!(path = %err.path.display(), reason = %err.reason, "scan error");
    }
    Ok(())
}

async fn run_index(data_dir: &std::path::Path, args: IndexArgs) -> Result<()> {
    let config = resolve_config(data_dir, data_dir, None)?;
    let mut client = Client::connect(&config.socket_path()).await?;
    let (started, message) = client.trigger_index(args.root, args.force).await?;
    println!("started={started} message={message}");
    Ok(())
}

fn filter_params(min_size: &str, exclude: &[String], limit: usize) -> Result<FilterParams> {
    Ok(FilterParams {
        min_size: sizewatch_core::parse::parse_size(min_size)
            .with_context(|| format!("invalid --min-size: {min_size}"))?,
        exclude: exclude.to_vec(),
        limit,
    })
}

async fn run_ls(data_dir: &std::path::Path, args: FilterArgs) -> Result<()> {
    let config = resolve_config(data_dir, data_dir, None)?;
    let filter = filter_params(&args.min_size, &args.exclude, args.limit)?;
    let mut client = Client::connect(&config.socket_path()).await?;
    client
        .stream(
            Request::GetLargeFiles {
                root: args.root,
                filter,
            },
            |item| {
                if let Response::FileRecord(record) = item {
                    println!("{}\t{}", record.size, record.path.display());
                }
            },
        )
        .await?;
    Ok(())
}

async fn run_tree(data_dir: &std::path::Path, args: FilterArgs) -> Result<()> {
    let config = resolve_config(data_dir, data_dir, None)?;
    let filter = filter_params(&args.min_size, &args.exclude, args.limit)?;
    let mut client = Client::connect(&config.socket_path()).await?;
    let tree = client.get_tree(args.root, filter).await?;
    print_tree(&tree, 0);
    Ok(())
}

fn print_tree(node: &sizewatch_core::TreeNode, depth: usize) {
    let indent = "  ".repeat(depth);
    println!(
        "{indent}{}{}  {}",
        node.basename,
        if node.is_dir { "/" } else { "" },
        sizewatch_core::parse::format_size(node.size)
    );
    for child in &node.children {
        print_tree(child, depth + 1);
    }
}

async fn run_watch(data_dir: &std::path::Path, args: WatchArgs) -> Result<()> {
    let config = resolve_config(data_dir, data_dir, None)?;
    let filter = filter_params(&args.min_size, &[], 0)?;
    let mut client = Client::connect(&config.socket_path()).await?;

    let request = if args.tree {
        Request::WatchTree { root: args.root, filter }
    } else {
        Request::WatchLargeFiles { root: args.root, filter }
    };

    let status = client
        .stream(request, |item| {
            if let Response::ChangeEvent { event, lagging } = item {
                println!(
                    "{:?}\t{}\t{:?}{}",
                    event.kind,
                    event.path.display(),
                    event.size,
                    if lagging { "\t[lagging]" } else { "" }
                );
            }
        })
        .await?;
    info!(?status, "watch stream ended");
    Ok(())
}
