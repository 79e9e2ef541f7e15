//! Shared error taxonomy.
//!
//! Every crate in the workspace defines its own `thiserror` enums, but all
//! of them classify into one of these kinds so HTTP surfaces, consumers, and
//! supervisors agree on severity and status mapping.

use serde::Serialize;

/// Classification of an error, independent of which component raised it.
///
/// Operational kinds map onto HTTP statuses at the request boundary;
/// [`ErrorKind::Fatal`] is reserved for non-operational failures that must
/// terminate the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input or schema mismatch.
    Validation,
    /// Missing or invalid credentials.
    Authentication,
    /// Authenticated but not permitted.
    Authorization,
    /// Referenced resource missing.
    NotFound,
    /// State precondition violated.
    Conflict,
    /// Throttled.
    RateLimit,
    /// Upstream provider failure.
    ExternalService,
    /// Internal failure, operational.
    Service,
    /// Non-operational failure; triggers process exit.
    Fatal,
}

impl ErrorKind {
    /// Stable string form used in wire-level error envelopes.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation_error",
            Self::Authentication => "authentication_error",
            Self::Authorization => "authorization_error",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::RateLimit => "rate_limit",
            Self::ExternalService => "external_service_error",
            Self::Service => "service_error",
            Self::Fatal => "fatal_error",
        }
    }

    /// HTTP status this kind maps to at a request boundary.
    ///
    /// Fatal errors never reach a response; they get the generic 500 here
    /// only so the mapping is total.
    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Authentication => 401,
            Self::Authorization => 403,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::RateLimit => 429,
            Self::ExternalService => 502,
            Self::Service | Self::Fatal => 500,
        }
    }

    /// Whether the process should keep running after this error.
    #[must_use]
    pub const fn is_operational(self) -> bool {
        !matches!(self, Self::Fatal)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
