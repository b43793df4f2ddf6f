use shared::{DecodeError, RouteError};
use std::time::Duration;
use thiserror::Error;

use crate::commands::CommandKind;

/// Errors surfaced by the sync layer
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("push channel is not open")]
    NotConnected,
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("event could not be applied: {0}")]
    Route(#[from] RouteError),
    #[error("command rejected: {0}")]
    CommandRejected(String),
    #[error("no acknowledgment within {0:?}")]
    CommandTimeout(Duration),
    #[error("an identical {0} command is already pending")]
    AlreadyPending(CommandKind),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("snapshot fetch failed: {0}")]
    SnapshotFetchFailed(String),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("could not encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("session closed")]
    SessionClosed,
}

impl SyncError {
    /// Whether retrying (reconnecting, polling again, resubmitting) can succeed
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            SyncError::Unauthorized(_) | SyncError::InvalidEndpoint(_) | SyncError::SessionClosed
        )
    }
}
