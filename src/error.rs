//! Error types for the change cache.

use crate::types::Sequence;
use std::time::Duration;
use thiserror::Error;

/// Main error type for cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed feed payload: {0}")]
    MalformedInput(String),

    #[error("Sequence {seq:?} is not greater than current maximum {max:?}")]
    OrderingViolation { seq: Sequence, max: Sequence },

    #[error("Sequence not found: {0:?}")]
    SequenceNotFound(Sequence),

    #[error("Late sequence marker not found: {0:?}")]
    LateMarkerNotFound(Sequence),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Change cache is stopped")]
    Stopped,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl CacheError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::Timeout(_) | CacheError::Storage(_))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::MalformedInput(e.to_string())
    }
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
