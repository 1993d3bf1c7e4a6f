//! Connection-handling server loop (spec.md §4.7): one task per accepted
//! connection, each running a sequence of request/response pairs, some of
//! which are server-streaming. A `Request::Shutdown` on any connection fans
//! out through [`ShutdownHandle`] to stop the accept loop and every other
//! live connection.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use futures::{Sink, SinkExt, StreamExt};
use sizewatch_core::{CoreError, ExclusionMatcher, Filter, StatusCode};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::daemon::Orchestrator;
use crate::rpc::protocol::{codec, DaemonStatus, FilterParams, Request, Response};

/// Fans a shutdown signal out to the accept loop and every live connection.
/// A `Shutdown` RPC and the host's termination signal both trigger the same
/// handle, so either path converges on the same drain-and-stop behavior.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        ShutdownHandle { tx }
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Also used by `main` to block until a `Shutdown` RPC (or the host
    /// signal handler) fires `trigger`, so both paths converge on one
    /// drain-and-stop sequence.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        ShutdownHandle::new()
    }
}

/// Accept connections on `listener` until `shutdown` fires, spawning one
/// task per connection. Does not wait for in-flight connections to finish —
/// the caller observes that via the grace-period sleep in `main`.
pub async fn serve(listener: UnixListener, orchestrator: Arc<Orchestrator>, shutdown: ShutdownHandle) {
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let orch = Arc::clone(&orchestrator);
                        let conn_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, orch, conn_shutdown).await {
                                debug!(error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
            _ = shutdown_rx.recv() => {
                info!("rpc server: no longer accepting connections");
                return;
            }
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    orchestrator: Arc<Orchestrator>,
    shutdown: ShutdownHandle,
) -> anyhow::Result<()> {
    let framed = Framed::new(stream, codec());
    let (mut sink, mut source) = framed.split();
    let mut shutdown_rx = shutdown.subscribe();

    loop {
        let frame = tokio::select! {
            frame = source.next() => frame,
            _ = shutdown_rx.recv() => {
                send_response(&mut sink, Response::error(StatusCode::Cancelled, "daemon shutting down")).await?;
                return Ok(());
            }
        };

        let Some(frame) = frame else {
            return Ok(());
        };
        let bytes = frame?;

        let request: Request = match serde_json::from_slice(&bytes) {
            Ok(r) => r,
            Err(e) => {
                send_response(&mut sink, Response::error(StatusCode::InvalidArgument, e.to_string())).await?;
                continue;
            }
        };

        let is_shutdown = matches!(request, Request::Shutdown);
        dispatch(&mut sink, &orchestrator, request, &mut shutdown_rx).await?;
        if is_shutdown {
            shutdown.trigger();
            return Ok(());
        }
    }
}

async fn dispatch<W>(
    sink: &mut W,
    orchestrator: &Arc<Orchestrator>,
    request: Request,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> anyhow::Result<()>
where
    W: Sink<Bytes, Error = std::io::Error> + Unpin,
{
    match request {
        Request::GetLargeFiles { root, filter } => {
            let deadline = orchestrator.config().unary_deadline();
            match tokio::time::timeout(deadline, handle_get_large_files(sink, orchestrator, root, filter)).await {
                Ok(result) => result,
                Err(_) => unary_timeout_response(sink, orchestrator, "GetLargeFiles").await,
            }
        }
        Request::GetTree { root, filter } => {
            let deadline = orchestrator.config().unary_deadline();
            match tokio::time::timeout(deadline, handle_get_tree(sink, orchestrator, root, filter)).await {
                Ok(result) => result,
                Err(_) => unary_timeout_response(sink, orchestrator, "GetTree").await,
            }
        }
        Request::WatchLargeFiles { root, filter } => {
            handle_watch(sink, orchestrator, root, filter, "WatchLargeFiles", shutdown_rx).await
        }
        Request::WatchTree { root, filter } => {
            handle_watch(sink, orchestrator, root, filter, "WatchTree", shutdown_rx).await
        }
        Request::GetIndexStatus { root } => {
            let deadline = orchestrator.config().unary_deadline();
            match tokio::time::timeout(deadline, handle_get_index_status(sink, orchestrator, root)).await {
                Ok(result) => result,
                Err(_) => unary_timeout_response(sink, orchestrator, "GetIndexStatus").await,
            }
        }
        Request::TriggerIndex { root, force } => {
            let deadline = orchestrator.config().unary_deadline();
            match tokio::time::timeout(deadline, handle_trigger_index(sink, orchestrator, root, force)).await {
                Ok(result) => result,
                Err(_) => unary_timeout_response(sink, orchestrator, "TriggerIndex").await,
            }
        }
        Request::GetDaemonStatus => {
            let deadline = orchestrator.config().unary_deadline();
            match tokio::time::timeout(deadline, handle_get_daemon_status(sink, orchestrator)).await {
                Ok(result) => result,
                Err(_) => unary_timeout_response(sink, orchestrator, "GetDaemonStatus").await,
            }
        }
        Request::ClearCache { path } => {
            let deadline = orchestrator.config().unary_deadline();
            match tokio::time::timeout(deadline, handle_clear_cache(sink, orchestrator, path)).await {
                Ok(result) => result,
                Err(_) => unary_timeout_response(sink, orchestrator, "ClearCache").await,
            }
        }
        Request::Shutdown => send_response(sink, Response::ok()).await,
    }
}

/// Bounds a unary handler to the configured deadline. On expiry the client
/// gets a `ResourceExhausted` terminal response rather than a silently
/// stuck connection. Streaming RPCs (`WatchLargeFiles`/`WatchTree`) are
/// long-lived by design and are not subject to this deadline.
async fn unary_timeout_response<W>(
    sink: &mut W,
    orchestrator: &Arc<Orchestrator>,
    rpc_name: &'static str,
) -> anyhow::Result<()>
where
    W: Sink<Bytes, Error = std::io::Error> + Unpin,
{
    orchestrator.metrics().rpc_call(rpc_name, status_label(StatusCode::ResourceExhausted));
    send_response(
        sink,
        Response::error(StatusCode::ResourceExhausted, format!("{rpc_name} exceeded unary deadline")),
    )
    .await
}

fn status_label(code: StatusCode) -> &'static str {
    match code {
        StatusCode::Ok => "ok",
        StatusCode::NotFound => "not_found",
        StatusCode::InvalidArgument => "invalid_argument",
        StatusCode::FailedPrecondition => "failed_precondition",
        StatusCode::PermissionDenied => "permission_denied",
        StatusCode::Cancelled => "cancelled",
        StatusCode::ResourceExhausted => "resource_exhausted",
        StatusCode::Internal => "internal",
    }
}

fn build_filter(params: &FilterParams) -> Filter {
    Filter::default()
        .with_min_size(params.min_size)
        .with_exclude(ExclusionMatcher::compile_lenient(&params.exclude))
        .with_limit(params.limit)
}

async fn send_response<W>(sink: &mut W, response: Response) -> anyhow::Result<()>
where
    W: Sink<Bytes, Error = std::io::Error> + Unpin,
{
    let payload = serde_json::to_vec(&response)?;
    sink.send(Bytes::from(payload)).await?;
    Ok(())
}

async fn handle_get_large_files<W>(
    sink: &mut W,
    orchestrator: &Arc<Orchestrator>,
    root: PathBuf,
    filter: FilterParams,
) -> anyhow::Result<()>
where
    W: Sink<Bytes, Error = std::io::Error> + Unpin,
{
    let result: Result<Vec<_>, CoreError> = async {
        let index = orchestrator.ensure_indexed(root.clone(), false).await?;
        let filt = build_filter(&filter);
        index.large_files(&filt)
    }
    .await;

    match result {
        Ok(files) => {
            for record in files {
                send_response(sink, Response::FileRecord(record)).await?;
            }
            orchestrator.metrics().rpc_call("GetLargeFiles", "ok");
            send_response(sink, Response::ok()).await
        }
        Err(e) => {
            orchestrator.metrics().rpc_call("GetLargeFiles", status_label(e.code()));
            send_response(sink, Response::error(e.code(), e.to_string())).await
        }
    }
}

async fn handle_get_tree<W>(
    sink: &mut W,
    orchestrator: &Arc<Orchestrator>,
    root: PathBuf,
    filter: FilterParams,
) -> anyhow::Result<()>
where
    W: Sink<Bytes, Error = std::io::Error> + Unpin,
{
    let result = async {
        let index = orchestrator.ensure_indexed(root.clone(), false).await?;
        let filt = build_filter(&filter);
        index.tree(&filt)
    }
    .await;

    match result {
        Ok(tree) => {
            orchestrator.metrics().rpc_call("GetTree", "ok");
            send_response(sink, Response::Tree(tree)).await
        }
        Err(e) => {
            orchestrator.metrics().rpc_call("GetTree", status_label(e.code()));
            send_response(sink, Response::error(e.code(), e.to_string())).await
        }
    }
}

async fn handle_get_index_status<W>(
    sink: &mut W,
    orchestrator: &Arc<Orchestrator>,
    root: PathBuf,
) -> anyhow::Result<()>
where
    W: Sink<Bytes, Error = std::io::Error> + Unpin,
{
    match orchestrator.indexes().get(&root) {
        Ok(index) => {
            orchestrator.metrics().rpc_call("GetIndexStatus", "ok");
            send_response(sink, Response::IndexStatus(index.status())).await
        }
        Err(e) => {
            orchestrator.metrics().rpc_call("GetIndexStatus", status_label(e.code()));
            send_response(sink, Response::error(e.code(), e.to_string())).await
        }
    }
}

async fn handle_trigger_index<W>(
    sink: &mut W,
    orchestrator: &Arc<Orchestrator>,
    root: PathBuf,
    force: bool,
) -> anyhow::Result<()>
where
    W: Sink<Bytes, Error = std::io::Error> + Unpin,
{
    match orchestrator.trigger(root, force).await {
        Ok((started, message)) => {
            orchestrator.metrics().rpc_call("TriggerIndex", "ok");
            send_response(sink, Response::TriggerResult { started, message }).await
        }
        Err(e) => {
            orchestrator.metrics().rpc_call("TriggerIndex", status_label(e.code()));
            send_response(sink, Response::error(e.code(), e.to_string())).await
        }
    }
}

async fn handle_get_daemon_status<W>(sink: &mut W, orchestrator: &Arc<Orchestrator>) -> anyhow::Result<()>
where
    W: Sink<Bytes, Error = std::io::Error> + Unpin,
{
    let status = DaemonStatus {
        uptime_secs: orchestrator.uptime().as_secs(),
        memory_bytes: crate::daemon::process_memory_bytes(),
        watched_paths: orchestrator.watched_roots(),
        cache_bytes: orchestrator.cache_bytes_estimate(),
        total_files: orchestrator.total_files(),
    };
    orchestrator.metrics().rpc_call("GetDaemonStatus", "ok");
    send_response(sink, Response::DaemonStatus(status)).await
}

async fn handle_clear_cache<W>(
    sink: &mut W,
    orchestrator: &Arc<Orchestrator>,
    path: Option<PathBuf>,
) -> anyhow::Result<()>
where
    W: Sink<Bytes, Error = std::io::Error> + Unpin,
{
    let entries_cleared = orchestrator.clear(path.as_deref());
    orchestrator.metrics().rpc_call("ClearCache", "ok");
    send_response(sink, Response::ClearResult { entries_cleared }).await
}

#[allow(clippy::too_many_arguments)]
async fn handle_watch<W>(
    sink: &mut W,
    orchestrator: &Arc<Orchestrator>,
    root: PathBuf,
    filter: FilterParams,
    rpc_name: &'static str,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> anyhow::Result<()>
where
    W: Sink<Bytes, Error = std::io::Error> + Unpin,
{
    let index = match orchestrator.ensure_indexed(root.clone(), false).await {
        Ok(idx) => idx,
        Err(e) => {
            orchestrator.metrics().rpc_call(rpc_name, status_label(e.code()));
            return send_response(sink, Response::error(e.code(), e.to_string())).await;
        }
    };

    let threshold = filter.min_size.max(index.threshold());
    let exclude = ExclusionMatcher::compile_lenient(&filter.exclude);
    let mut sub = orchestrator.dispatcher().subscribe(root);

    loop {
        tokio::select! {
            item = sub.rx.recv() => {
                match item {
                    Some(dispatched) => {
                        if dispatched.lagging {
                            orchestrator.metrics().subscription_drop();
                        }
                        let below_threshold = dispatched.event.size.map(|s| s < threshold).unwrap_or(false);
                        if below_threshold || exclude.matches_path(&dispatched.event.path) {
                            continue;
                        }
                        send_response(sink, Response::ChangeEvent {
                            event: dispatched.event,
                            lagging: dispatched.lagging,
                        }).await?;
                    }
                    None => {
                        let code = if sub.lag_cancelled() {
                            orchestrator.metrics().subscription_cancelled_lagging();
                            StatusCode::ResourceExhausted
                        } else {
                            StatusCode::Ok
                        };
                        orchestrator.metrics().rpc_call(rpc_name, status_label(code));
                        return send_response(sink, Response::Terminal { code, message: None }).await;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                orchestrator.metrics().rpc_call(rpc_name, "cancelled");
                return send_response(sink, Response::Terminal {
                    code: StatusCode::Cancelled,
                    message: Some("daemon shutting down".into()),
                }).await;
            }
        }
    }
}
