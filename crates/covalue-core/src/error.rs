//! Error types for CoValue core primitives.

use thiserror::Error;

use crate::ids::{CoId, SessionId};

/// Errors raised while building, verifying or reading session logs.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("id mismatch: header hashes to {actual}, expected {expected}")]
    IdMismatch { expected: CoId, actual: CoId },

    #[error("invalid signature for session {0}")]
    InvalidSignature(SessionId),

    #[error("cannot determine signer for session {0}")]
    UnknownSigner(SessionId),

    #[error("transaction {index} not found in session {session}")]
    TransactionNotFound { session: SessionId, index: u32 },

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("cannot add transactions to deleted CoValue {0}")]
    DeletedCoValue(CoId),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("malformed packed changes: {0}")]
    MalformedPack(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
