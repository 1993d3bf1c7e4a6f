//! Client-side helpers for issuing requests against a running daemon over
//! its Unix socket (spec.md §4.7). Used by the CLI subcommands; nothing
//! here is daemon-only.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use sizewatch_core::StatusCode;
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use super::protocol::{codec, DaemonStatus, FilterParams, Request, Response};

/// A connection to one daemon instance, framed with the same length-
/// delimited codec the server uses. Each call sends one request and reads
/// responses until a `Terminal` frame closes out that request; the
/// underlying stream is then free for the next call.
pub struct Client {
    framed: Framed<UnixStream, tokio_util::codec::LengthDelimitedCodec>,
}

impl Client {
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("connecting to {}", socket_path.display()))?;
        Ok(Client {
            framed: Framed::new(stream, codec()),
        })
    }

    async fn send(&mut self, request: Request) -> Result<()> {
        let payload = serde_json::to_vec(&request)?;
        self.framed.send(Bytes::from(payload)).await?;
        Ok(())
    }

    async fn recv_one(&mut self) -> Result<Response> {
        let frame = self
            .framed
            .next()
            .await
            .ok_or_else(|| anyhow::anyhow!("connection closed before a response arrived"))??;
        Ok(serde_json::from_slice(&frame)?)
    }

    /// Unary call: send one request, read exactly one response frame, and
    /// surface a non-OK terminal status as an error.
    async fn call_unary(&mut self, request: Request) -> Result<Response> {
        self.send(request).await?;
        let response = self.recv_one().await?;
        if let Response::Terminal { code, message } = &response {
            if !matches!(code, StatusCode::Ok) {
                bail!(
                    "request failed: {:?}{}",
                    code,
                    message.as_deref().map(|m| format!(": {m}")).unwrap_or_default()
                );
            }
        }
        Ok(response)
    }

    pub async fn get_tree(&mut self, root: PathBuf, filter: FilterParams) -> Result<sizewatch_core::TreeNode> {
        match self.call_unary(Request::GetTree { root, filter }).await? {
            Response::Tree(tree) => Ok(tree),
            other => bail!("unexpected response to GetTree: {other:?}"),
        }
    }

    pub async fn get_index_status(&mut self, root: PathBuf) -> Result<sizewatch_core::IndexStatus> {
        match self.call_unary(Request::GetIndexStatus { root }).await? {
            Response::IndexStatus(status) => Ok(status),
            other => bail!("unexpected response to GetIndexStatus: {other:?}"),
        }
    }

    pub async fn trigger_index(&mut self, root: PathBuf, force: bool) -> Result<(bool, String)> {
        match self.call_unary(Request::TriggerIndex { root, force }).await? {
            Response::TriggerResult { started, message } => Ok((started, message)),
            other => bail!("unexpected response to TriggerIndex: {other:?}"),
        }
    }

    pub async fn get_daemon_status(&mut self) -> Result<DaemonStatus> {
        match self.call_unary(Request::GetDaemonStatus).await? {
            Response::DaemonStatus(status) => Ok(status),
            other => bail!("unexpected response to GetDaemonStatus: {other:?}"),
        }
    }

    pub async fn clear_cache(&mut self, path: Option<PathBuf>) -> Result<u64> {
        match self.call_unary(Request::ClearCache { path }).await? {
            Response::ClearResult { entries_cleared } => Ok(entries_cleared),
            other => bail!("unexpected response to ClearCache: {other:?}"),
        }
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.call_unary(Request::Shutdown).await?;
        Ok(())
    }

    /// Server-streaming call: send the request, then invoke `on_item` for
    /// every non-terminal frame until the `Terminal` frame arrives. Returns
    /// the terminal status code so the caller can distinguish a clean
    /// end-of-stream from `CANCELLED`/`RESOURCE_EXHAUSTED`.
    pub async fn stream(
        &mut self,
        request: Request,
        mut on_item: impl FnMut(Response),
    ) -> Result<StatusCode> {
        self.send(request).await?;
        loop {
            match self.recv_one().await? {
                Response::Terminal { code, message } => {
                    if let Some(message) = message {
                        if !matches!(code, StatusCode::Ok) {
                            bail!("stream terminated with {code:?}: {message}");
                        }
                    }
                    return Ok(code);
                }
                item => on_item(item),
            }
        }
    }
}

/// Poll `socket_path` and `status_path` every 100ms for up to `timeout`,
/// per spec.md §4.8's `start` client helper: success as soon as either the
/// socket exists or the status file reads `ready`; failure if the status
/// file reads `error` or the timeout elapses.
pub async fn wait_for_ready(socket_path: &Path, status_path: &Path, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if socket_path.exists() {
            return Ok(());
        }
        if let Ok(contents) = tokio::fs::read_to_string(status_path).await {
            if let Ok(status) = serde_json::from_str::<crate::daemon::StatusFile>(&contents) {
                match status.status.as_str() {
                    "ready" => return Ok(()),
                    "error" => bail!(
                        "daemon failed to start: {}",
                        status.error.unwrap_or_else(|| "unknown error".to_string())
                    ),
                    _ => {}
                }
            }
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out waiting for daemon to become ready");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Poll for `pid_path`'s disappearance every 100ms for up to `timeout`, per
/// spec.md §4.8's `stop` client helper.
pub async fn wait_for_pid_file_removed(pid_path: &Path, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while pid_path.exists() {
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out waiting for daemon to stop");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_for_ready_times_out_when_nothing_appears() {
        let dir = tempfile::tempdir().unwrap();
        let err = wait_for_ready(
            &dir.path().join("none.sock"),
            &dir.path().join("none.status"),
            Duration::from_millis(150),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn wait_for_ready_succeeds_on_status_file() {
        let dir = tempfile::tempdir().unwrap();
        let status_path = dir.path().join("a.status");
        tokio::fs::write(&status_path, r#"{"status":"ready","pid":1}"#)
            .await
            .unwrap();
        wait_for_ready(&dir.path().join("a.sock"), &status_path, Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_for_ready_surfaces_error_status() {
        let dir = tempfile::tempdir().unwrap();
        let status_path = dir.path().join("a.status");
        tokio::fs::write(&status_path, r#"{"status":"error","error":"bind failed"}"#)
            .await
            .unwrap();
        let err = wait_for_ready(&dir.path().join("a.sock"), &status_path, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bind failed"));
    }
}
