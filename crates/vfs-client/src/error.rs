//! Error types for the connection layer

use crate::identity::DaemonIdentity;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vfs_protocol::{strip_remote_error, RpcError, CANCELLED, SERVICE_UNKNOWN, UNKNOWN_OBJECT};

pub type Result<T> = std::result::Result<T, VfsError>;

#[derive(Debug, thiserror::Error)]
pub enum VfsError {
    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Daemon unreachable: {0}")]
    Unreachable(String),

    /// A cached connection for this identity died. The cache entry is gone
    /// and the caller should retry.
    #[error("Cache invalid for {0}, retry (internally handled)")]
    Stale(DaemonIdentity),

    #[error("{message}")]
    Remote {
        code: i32,
        name: Option<String>,
        message: String,
    },

    #[error("Connection closed")]
    Closed,

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("An object is already exported at {0}")]
    AlreadyExported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VfsError {
    /// Only a stale cache hit is worth retrying right away.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VfsError::Stale(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, VfsError::Cancelled)
    }
}

impl From<RpcError> for VfsError {
    fn from(err: RpcError) -> Self {
        let (name, message) = strip_remote_error(&err.message);
        match err.code {
            CANCELLED => VfsError::Cancelled,
            SERVICE_UNKNOWN | UNKNOWN_OBJECT => VfsError::Unreachable(message),
            code => VfsError::Remote {
                code,
                name,
                message,
            },
        }
    }
}

impl From<serde_json::Error> for VfsError {
    fn from(err: serde_json::Error) -> Self {
        VfsError::Protocol(err.to_string())
    }
}

/// Turn `result` into [`VfsError::Cancelled`] if `cancel` has fired.
///
/// Operations that complete after their caller gave up must still report
/// the cancellation rather than a late success.
pub fn complete_with_cancellable<T>(
    result: Result<T>,
    cancel: Option<&CancellationToken>,
) -> Result<T> {
    match cancel {
        Some(token) if token.is_cancelled() => Err(VfsError::Cancelled),
        _ => result,
    }
}
