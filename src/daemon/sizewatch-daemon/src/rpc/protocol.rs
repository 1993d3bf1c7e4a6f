//! Wire messages and framing for the Unix-socket RPC surface (spec.md §4.7,
//! §6). Frames are length-prefixed: `tokio_util::codec::LengthDelimitedCodec`
//! supplies the 4-byte big-endian length prefix, `serde_json` supplies the
//! body.

use serde::{Deserialize, Serialize};
use sizewatch_core::{ChangeEvent, FileRecord, IndexStatus, StatusCode, TreeNode};
use std::path::PathBuf;
use tokio_util::codec::LengthDelimitedCodec;

/// Build the codec every connection frames its byte stream with.
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::new()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterParams {
    pub min_size: u64,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub limit: usize,
}

impl Default for FilterParams {
    fn default() -> Self {
        FilterParams {
            min_size: 0,
            exclude: Vec::new(),
            limit: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    GetLargeFiles { root: PathBuf, filter: FilterParams },
    GetTree { root: PathBuf, filter: FilterParams },
    WatchLargeFiles { root: PathBuf, filter: FilterParams },
    WatchTree { root: PathBuf, filter: FilterParams },
    GetIndexStatus { root: PathBuf },
    TriggerIndex { root: PathBuf, force: bool },
    GetDaemonStatus,
    ClearCache { path: Option<PathBuf> },
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub uptime_secs: u64,
    pub memory_bytes: u64,
    pub watched_paths: Vec<PathBuf>,
    pub cache_bytes: u64,
    pub total_files: u64,
}

/// One frame of a response. Unary RPCs send exactly one `Item` (or
/// `Terminal` on error) frame. Server-streaming RPCs send zero or more
/// `Item` frames followed by one `Terminal` frame, which plays the role of
/// spec.md's "end-of-stream marker followed by a status frame" collapsed
/// into a single terminal message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    FileRecord(FileRecord),
    Tree(TreeNode),
    ChangeEvent { event: ChangeEvent, lagging: bool },
    IndexStatus(IndexStatus),
    TriggerResult { started: bool, message: String },
    DaemonStatus(DaemonStatus),
    ClearResult { entries_cleared: u64 },
    Terminal { code: StatusCode, message: Option<String> },
}

impl Response {
    pub fn ok() -> Self {
        Response::Terminal {
            code: StatusCode::Ok,
            message: None,
        }
    }

    pub fn error(code: StatusCode, message: impl Into<String>) -> Self {
        Response::Terminal {
            code: StatusCode::Internal,
            message: Some(message.into()),
        }
        .with_code(code)
    }

    fn with_code(self, code: StatusCode) -> Self {
        match self {
            Response::Terminal { message, .. } => Response::Terminal { code, message },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_json() {
        let req = Request::GetLargeFiles {
            root: PathBuf::from("/data"),
            filter: FilterParams {
                min_size: 1024,
                exclude: vec!["**/.git/**".into()],
                limit: 50,
            },
        };
        let bytes = serde_json::to_vec(&req).unwrap();
        let decoded: Request = serde_json::from_slice(&bytes).unwrap();
        matches!(decoded, Request::GetLargeFiles { .. });
    }

    #[test]
    fn terminal_response_carries_status_code() {
        let resp = Response::error(StatusCode::NotFound, "root not found");
        let bytes = serde_json::to_vec(&resp).unwrap();
        let decoded: Response = serde_json::from_slice(&bytes).unwrap();
        match decoded {
            Response::Terminal { code, message } => {
                assert_eq!(code, StatusCode::NotFound);
                assert_eq!(message.as_deref(), Some("root not found"));
            }
            _ => panic!("expected Terminal"),
        }
    }
}
