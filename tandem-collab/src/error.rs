//! Error types of the sync layer.
//!
//! Transport failures never surface from mutation calls: they are reported
//! through connection state changes and drive the reconnection supervisor.

use tandem_core::ModelError;
use thiserror::Error;

use crate::protocol::ProtocolError;

/// Failures of the replicated document itself.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("shape not found: {0}")]
    ShapeNotFound(String),

    #[error("group not found: {0}")]
    GroupNotFound(String),

    #[error("invalid update: {0}")]
    InvalidUpdate(String),
}

/// Failures of the durable local store backing the offline queue.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid queue data: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid storage key: {0:?}")]
    InvalidKey(String),
}

/// Top-level error of the sync layer.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("not connected")]
    NotConnected,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection attempt timed out")]
    Timeout,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<ModelError> for SyncError {
    fn from(err: ModelError) -> Self {
        SyncError::Document(DocumentError::Model(err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Transport(err.to_string())
    }
}
