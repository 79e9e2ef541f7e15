//! Error types for the event bus.

use proofpulse_core::ErrorKind;
use thiserror::Error;

/// Errors raised by the bus producer and consumer.
#[derive(Error, Debug)]
pub enum BusError {
    /// Could not reach or authenticate with the brokers.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Publishing to a topic failed.
    #[error("Failed to publish to {topic}: {reason}")]
    PublishFailed {
        /// Topic the publish targeted.
        topic: String,
        /// Broker diagnostic.
        reason: String,
    },

    /// Subscribing to topics failed.
    #[error("Failed to subscribe to {topics:?}: {reason}")]
    SubscriptionFailed {
        /// Topics the subscription targeted.
        topics: Vec<String>,
        /// Broker diagnostic.
        reason: String,
    },

    /// An event failed schema validation at produce time.
    #[error("Invalid event {event_type}: {reason}")]
    InvalidEvent {
        /// Type of the rejected event.
        event_type: String,
        /// Validation errors, joined.
        reason: String,
    },

    /// A received message body could not be decoded.
    #[error("Failed to deserialize message: {0}")]
    DeserializationFailed(String),

    /// Transport-level failure while consuming.
    #[error("Transport error: {0}")]
    TransportError(String),
}

impl BusError {
    /// Classify this error into the shared taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidEvent { .. } | Self::DeserializationFailed(_) => ErrorKind::Validation,
            Self::ConnectionFailed(_)
            | Self::PublishFailed { .. }
            | Self::SubscriptionFailed { .. }
            | Self::TransportError(_) => ErrorKind::ExternalService,
        }
    }
}

/// Error returned by message handlers.
///
/// Handler failures are application-level; the consumer reports them to the
/// error sink and refuses to commit the offset, it does not interpret them.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    /// Convenience constructor.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_classify_into_taxonomy() {
        let invalid = BusError::InvalidEvent {
            event_type: "order.created".to_string(),
            reason: "missing total".to_string(),
        };
        assert_eq!(invalid.kind(), ErrorKind::Validation);

        let publish = BusError::PublishFailed {
            topic: "order-events".to_string(),
            reason: "broker down".to_string(),
        };
        assert_eq!(publish.kind(), ErrorKind::ExternalService);
    }
}
