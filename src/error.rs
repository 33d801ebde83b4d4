//! Domain error taxonomy.
//!
//! Top-level entry points (`main`, `cli::run`, `runtime::run`) propagate
//! `anyhow::Result`. Subsystems that callers need to match on (rather than
//! just log and bubble up) define a narrow `thiserror`-derived enum instead,
//! matching the teacher's `ShipperError` convention.

use thiserror::Error;

/// Errors returned by journal operations (C5).
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed journal entry at byte offset {offset}: {source}")]
    Malformed {
        offset: u64,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors returned by the store facade (C6).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("store query error: {0}")]
    Query(#[from] rusqlite::Error),
    #[error("query exceeded the configured timeout")]
    Timeout,
    #[error("query rejected: {0}")]
    Rejected(String),
}

/// Errors returned by the insert buffer (C4) when it cannot accept a record.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("journal append failed: {0}")]
    Journal(#[from] JournalError),
    #[error("batch insert failed after exhausting retries: {0}")]
    Store(#[from] StoreError),
}

/// Errors returned by the backup remote uploader (C8).
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("uploader misconfigured: {0}")]
    Config(String),
    #[error("upload command failed: {0}")]
    CommandFailed(String),
    #[error("upload I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the IPC query surface's JSON-RPC dispatch (C10).
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("parse error")]
    Parse,
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("application error: {0}")]
    Application(String),
}

impl RpcError {
    /// JSON-RPC 2.0 error code, per spec.md §4.10.
    pub fn code(&self) -> i64 {
        match self {
            RpcError::Parse => -32700,
            RpcError::MethodNotFound(_) => -32601,
            RpcError::InvalidParams(_) => -32602,
            RpcError::Internal(_) => -32603,
            RpcError::Application(_) => -32000,
        }
    }
}

impl From<StoreError> for RpcError {
    fn from(err: StoreError) -> Self {
        RpcError::Application(err.to_string())
    }
}
