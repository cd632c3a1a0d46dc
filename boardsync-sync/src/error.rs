//! Error types for boardsync-sync.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use boardsync_core::{BoardRef, StoreError};

/// Failures reported by a remote client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// HTTP 429 or an API-level complexity budget error.
    #[error("rate limited by remote service")]
    RateLimited { retry_after: Option<Duration> },

    /// Network failure or 5xx; worth retrying.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// The addressed item or board does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The service understood the request and refused it.
    #[error("rejected by remote service: {0}")]
    Rejected(String),

    /// A response could not be decoded.
    #[error("could not decode remote response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Whether the retry wrapper should try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::RateLimited { .. } | RemoteError::Transient(_))
    }
}

/// All errors that abort a reconciliation run.
///
/// Per-record failures never surface here; they are collected into the run
/// report instead.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Local store, mapping store or lock failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Remote failure during a run-level step (group lookup, full fetch).
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// A record or remote item lacks a resolvable identity.
    #[error("validation error: {0}")]
    Validation(String),

    /// None of the configured groups exist on the board.
    #[error("no usable target group on board {board}")]
    NoTargetGroup { board: BoardRef },

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization error (mapping store).
    #[error("mapping store JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// True when the run stopped because the mapping lock could not be taken.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, SyncError::Store(StoreError::LockTimeout { .. }))
    }
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
