//! Error types for the permissions module.

use thiserror::Error;

use covalue_core::CoId;

/// Errors that can occur during permission operations.
#[derive(Debug, Error)]
pub enum PermsError {
    /// Permission denied.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A role string that is not one of the known roles.
    #[error("invalid role: {0}")]
    InvalidRole(String),

    /// No read key is available to this agent.
    #[error("no read key available in group {0}")]
    MissingReadKey(CoId),

    /// The header does not describe a group.
    #[error("{0} is not a group")]
    NotAGroup(CoId),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Core error.
    #[error("core error: {0}")]
    Core(#[from] covalue_core::CoreError),
}

/// Result type for permission operations.
pub type Result<T> = std::result::Result<T, PermsError>;
