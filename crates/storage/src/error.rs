//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("offset mismatch: expected {expected}, storage holds {actual}")]
    OffsetMismatch { expected: u64, actual: u64 },

    #[error("part {part_number} is {size} bytes, below the {min} byte minimum for non-final parts")]
    PartSizeViolation {
        part_number: i32,
        size: u64,
        min: u64,
    },

    #[error("upload would exceed the {max} part limit")]
    TooManyParts { max: i32 },

    #[error("upload expired: {0}")]
    Expired(String),

    #[error("backend state error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Whether repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
