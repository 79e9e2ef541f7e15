//! Error types for the broker, with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use proofpulse_core::ErrorKind;
use serde::Serialize;
use thiserror::Error;

/// Errors raised by the real-time broker.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// No bearer token in the Authorization header or `token` query param.
    #[error("Missing bearer token")]
    MissingToken,

    /// The token failed verification.
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// The identity has too many live connections.
    #[error("Connection limit reached for this identity")]
    ConnectionLimit,

    /// The identity may not subscribe to the channel.
    #[error("Access denied to channel")]
    ChannelDenied {
        /// The channel that was requested.
        channel: String,
    },

    /// The connection id is unknown (already cleaned up).
    #[error("Unknown connection: {0}")]
    ConnectionNotFound(String),

    /// The connection is not in the OPEN state.
    #[error("Connection is not open")]
    NotOpen,

    /// The fan-out bus failed.
    #[error("Pub/sub error: {0}")]
    PubSub(String),
}

impl BrokerError {
    /// Classify into the shared taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingToken | Self::InvalidToken(_) => ErrorKind::Authentication,
            Self::ChannelDenied { .. } => ErrorKind::Authorization,
            Self::ConnectionLimit => ErrorKind::RateLimit,
            Self::ConnectionNotFound(_) => ErrorKind::NotFound,
            Self::NotOpen => ErrorKind::Conflict,
            Self::PubSub(_) => ErrorKind::Service,
        }
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    success: bool,
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    kind: &'static str,
    message: String,
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        if kind == ErrorKind::Service {
            tracing::error!(error = %self, "Broker request failed");
        }
        let status =
            StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorEnvelope {
            success: false,
            error: ErrorBody {
                kind: kind.as_str(),
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failures_map_to_401() {
        assert_eq!(BrokerError::MissingToken.kind().http_status(), 401);
        assert_eq!(
            BrokerError::InvalidToken("expired".into()).kind().http_status(),
            401
        );
    }

    #[test]
    fn channel_denial_maps_to_403() {
        let error = BrokerError::ChannelDenied {
            channel: "site:other:notifications".into(),
        };
        assert_eq!(error.kind().http_status(), 403);
    }

    #[test]
    fn connection_limit_maps_to_429() {
        assert_eq!(BrokerError::ConnectionLimit.kind().http_status(), 429);
    }
}
