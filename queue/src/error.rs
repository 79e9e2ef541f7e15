//! Error types for the queue layer.

use proofpulse_core::ErrorKind;
use thiserror::Error;

/// Errors raised by queue operations.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The backend (Redis or in-memory) failed.
    #[error("Queue backend error: {0}")]
    Backend(String),

    /// An item failed the enqueue preconditions.
    #[error("Invalid queue item: {0}")]
    InvalidItem(String),

    /// An item could not be serialized for storage.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl QueueError {
    /// Classify into the shared taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Backend(_) => ErrorKind::Service,
            Self::InvalidItem(_) | Self::Serialization(_) => ErrorKind::Validation,
        }
    }
}
