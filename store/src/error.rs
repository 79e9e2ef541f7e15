//! Error types for the event store.

use proofpulse_core::ErrorKind;
use thiserror::Error;

/// Errors raised by event store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database connection or query failure.
    #[error("Database error: {0}")]
    Database(String),

    /// An event row could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An event id collided with an existing one.
    #[error("Event already stored: {0}")]
    Duplicate(String),

    /// Replay was asked to continue past a stop signal.
    #[error("Replay stopped")]
    ReplayStopped,
}

impl StoreError {
    /// Classify into the shared taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Database(_) => ErrorKind::Service,
            Self::Serialization(_) => ErrorKind::Validation,
            Self::Duplicate(_) => ErrorKind::Conflict,
            Self::ReplayStopped => ErrorKind::Conflict,
        }
    }
}
