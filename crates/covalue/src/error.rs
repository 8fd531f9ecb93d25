//! Error types for the node.

use covalue_core::{CoId, CoreError};
use covalue_perms::PermsError;
use covalue_store::StoreError;
use covalue_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Core error (IDs, signatures, transactions).
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Permission error.
    #[error("permission error: {0}")]
    Permission(#[from] PermsError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Neither storage nor any peer has the CoValue.
    #[error("CoValue unavailable: {0}")]
    Unavailable(CoId),

    /// The CoValue is not of the kind the operation expects.
    #[error("{id} is not a {expected}")]
    WrongType { id: CoId, expected: &'static str },

    /// A list index past the end of the list.
    #[error("no item at index {index} of {id}")]
    InvalidIndex { id: CoId, index: usize },

    /// The agent lacks the role the operation requires.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// Signature mismatch recovery could not complete.
    #[error("recovery of {id} failed: {reason}")]
    Recovery { id: CoId, reason: String },

    /// A wait did not complete in time.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The node has been shut down.
    #[error("node is shut down")]
    Closed,
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
