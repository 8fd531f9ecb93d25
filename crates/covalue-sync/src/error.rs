//! Error types for the sync crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// A frame that does not decode to a protocol message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("transport error: {0}")]
    TransportError(String),

    /// The other end of the transport is gone.
    #[error("connection closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SyncError>;
