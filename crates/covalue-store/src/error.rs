//! Error types for the store module.

use thiserror::Error;

use covalue_core::{CoId, CoreError};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Row payload serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A session or transaction row references data that is not there.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Replacement content that does not form a contiguous history.
    #[error("invalid session replacement for {id}: {reason}")]
    InvalidReplacement { id: CoId, reason: String },

    /// The CoValue has no row yet.
    #[error("unknown CoValue: {0}")]
    UnknownCoValue(CoId),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// The storage worker died; nothing about in-flight requests is known.
    #[error("storage worker crashed")]
    WorkerCrashed,

    /// A blocking database task panicked or was cancelled.
    #[error("storage task failed: {0}")]
    Task(String),

    /// The storage has been closed.
    #[error("storage closed")]
    Closed,

    /// Core error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
