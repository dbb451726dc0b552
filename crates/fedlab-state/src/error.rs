//! Error types for the fedlab record store.

use thiserror::Error;

/// Result type alias for record store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during record store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("store lock poisoned")]
    Lock,

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("invalid record: {0}")]
    Invalid(String),
}
