//! Shared error kinds and wire status codes.
//!
//! `StatusCode` is the closed set of outcomes every RPC response frame
//! carries (see the daemon's `rpc::protocol` module); `CoreError` is what
//! library code actually returns, and maps onto a `StatusCode` at the RPC
//! boundary via [`CoreError::code`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Status codes carried by every RPC response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    NotFound,
    InvalidArgument,
    FailedPrecondition,
    PermissionDenied,
    Cancelled,
    ResourceExhausted,
    Internal,
}

/// Errors shared across the scan engine, index store, and RPC layer.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("root not found: {0}")]
    NotFound(PathBuf),

    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("index for {0} is not ready")]
    NotReady(PathBuf),

    #[error("unknown root: {0}")]
    UnknownRoot(PathBuf),

    #[error("index for {0} is busy indexing")]
    Busy(PathBuf),

    #[error("permission denied: {path}: {reason}")]
    PermissionDenied { path: PathBuf, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("subscription terminated due to persistent lag")]
    ResourceExhausted,

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Map to the wire status code carried in an RPC response frame.
    pub fn code(&self) -> StatusCode {
        match self {
            CoreError::NotFound(_) | CoreError::UnknownRoot(_) => StatusCode::NotFound,
            CoreError::NotADirectory(_) | CoreError::InvalidArgument(_) => {
                StatusCode::InvalidArgument
            }
            CoreError::NotReady(_) | CoreError::Busy(_) => StatusCode::FailedPrecondition,
            CoreError::PermissionDenied { .. } => StatusCode::PermissionDenied,
            CoreError::Cancelled => StatusCode::Cancelled,
            CoreError::ResourceExhausted => StatusCode::ResourceExhausted,
            CoreError::Internal(_) => StatusCode::Internal,
        }
    }
}

/// A single non-fatal per-path error accumulated during a scan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanErrorRecord {
    pub path: PathBuf,
    pub reason: String,
}

pub type CoreResult<T> = Result<T, CoreError>;
