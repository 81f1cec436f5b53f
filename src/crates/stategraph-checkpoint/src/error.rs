//! Error types for channels and checkpoint persistence

use thiserror::Error;

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors raised by channels and checkpoint backends
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Checkpoint not found
    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid checkpoint or request
    #[error("Invalid checkpoint: {0}")]
    Invalid(String),

    /// A put would break the append-only ordering of a thread
    #[error("Checkpoint conflict: {0}")]
    Conflict(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Read from a channel that holds no value
    #[error("Channel is empty")]
    EmptyChannel,

    /// A channel rejected the shape of a write
    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    /// More writers in one superstep than the merge function allows
    #[error("Concurrent update: {0}")]
    ConcurrentUpdate(String),

    /// Custom error
    #[error("{0}")]
    Custom(String),
}
