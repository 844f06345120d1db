use thiserror::Error;

use crate::types::SequenceId;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("request timed out")]
    Timeout,

    #[error("stale message rejected: sequence {sequence} <= last applied {last_applied}")]
    StaleMessage {
        sequence: SequenceId,
        last_applied: SequenceId,
    },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("snapshot fetch failed for {symbol}: {reason}")]
    SnapshotFetchFailed { symbol: String, reason: String },

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Http { status, .. } => *status >= 500 || *status == 429,
            SyncError::Request(_)
            | SyncError::Timeout
            | SyncError::SnapshotFetchFailed { .. }
            | SyncError::ConnectionLost(_)
            | SyncError::WebSocket(_) => true,
            SyncError::StaleMessage { .. }
            | SyncError::Malformed(_)
            | SyncError::Cancelled
            | SyncError::Config(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
