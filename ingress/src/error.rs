//! Error types for webhook ingress.

use proofpulse_core::ErrorKind;
use thiserror::Error;

/// Errors raised while receiving and normalizing a webhook.
#[derive(Error, Debug)]
pub enum IngressError {
    /// A required provider header is absent.
    #[error("Missing required header: {0}")]
    MissingHeader(&'static str),

    /// A header was present but unreadable or malformed.
    #[error("Malformed header {header}: {reason}")]
    MalformedHeader {
        /// Header name.
        header: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// The HMAC signature did not match the raw body.
    #[error("Webhook signature verification failed")]
    InvalidSignature,

    /// The signature timestamp fell outside the replay window.
    #[error("Webhook signature timestamp outside the replay window")]
    StaleSignature,

    /// No provider registered under the requested name.
    #[error("Unknown webhook provider: {0}")]
    UnknownProvider(String),

    /// The payload could not be turned into a canonical event.
    #[error("Failed to normalize webhook payload: {0}")]
    Normalization(String),
}

impl IngressError {
    /// Classify into the shared taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingHeader(_) | Self::MalformedHeader { .. } | Self::Normalization(_) => {
                ErrorKind::Validation
            }
            Self::InvalidSignature | Self::StaleSignature => ErrorKind::Authentication,
            Self::UnknownProvider(_) => ErrorKind::NotFound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_failures_are_authentication_errors() {
        assert_eq!(IngressError::InvalidSignature.kind(), ErrorKind::Authentication);
        assert_eq!(IngressError::StaleSignature.kind(), ErrorKind::Authentication);
        assert_eq!(
            IngressError::MissingHeader("x-shopify-hmac-sha256").kind(),
            ErrorKind::Validation
        );
    }
}
