//! Error types shared across the hub.

use thiserror::Error;

/// Failure inside the sqlite store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Failure reported by a collaborator (tenant lookup, audit, event, mail or
/// frame persistence).
#[derive(Debug, Error)]
pub enum PersistError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("frame is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("agent id {0:?} is not usable as a storage key")]
    InvalidAgentId(String),

    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for PersistError {
    fn from(e: rusqlite::Error) -> Self {
        PersistError::Store(StoreError::Sqlite(e))
    }
}

impl From<std::io::Error> for PersistError {
    fn from(e: std::io::Error) -> Self {
        PersistError::Store(StoreError::Io(e))
    }
}

/// Failure dispatching an operator command.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("audit append failed, command not sent: {0}")]
    Audit(#[source] PersistError),
}
