//! Error types for the materializer.

use proofpulse_core::ErrorKind;
use proofpulse_queue::QueueError;
use thiserror::Error;

/// Errors raised while materializing notifications.
#[derive(Error, Debug)]
pub enum MaterializerError {
    /// Template lookup or store access failed.
    #[error("Template store error: {0}")]
    Store(String),

    /// Template compilation or rendering failed.
    #[error("Render failed for template {template_id}: {reason}")]
    Render {
        /// The template that failed.
        template_id: String,
        /// Engine diagnostic.
        reason: String,
    },

    /// Rendering exceeded its time budget.
    #[error("Render timed out for template {0}")]
    RenderTimeout(String),

    /// A notification status transition violated the lifecycle DAG.
    #[error("Invalid notification transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status.
        from: &'static str,
        /// Requested status.
        to: &'static str,
    },

    /// Enqueueing the rendered notification failed.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl MaterializerError {
    /// Classify into the shared taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(_) | Self::RenderTimeout(_) => ErrorKind::Service,
            Self::Render { .. } => ErrorKind::Validation,
            Self::InvalidTransition { .. } => ErrorKind::Conflict,
            Self::Queue(e) => e.kind(),
        }
    }
}
