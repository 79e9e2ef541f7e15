//! The provider capability set and shared signature verification.
//!
//! A provider knows three things: which header names carry its tenant key
//! and signature, how to verify a signature against the raw body, and how
//! to turn its payload shapes into canonical events. Everything else -
//! routing, tenant resolution, producing - is the ingress router's job.
//!
//! Verification always runs against the raw request bytes, captured before
//! any JSON parsing, and signature comparison is constant-time.

use crate::error::IngressError;
use base64::Engine;
use constant_time_eq::constant_time_eq;
use hmac::{Hmac, Mac};
use http::HeaderMap;
use proofpulse_core::Event;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// The tenant a webhook resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    /// The provider-side shop domain (tenant key on the wire).
    pub shop_domain: String,
    /// Our organization id.
    pub organization_id: String,
    /// Our site id.
    pub site_id: String,
}

/// A webhook provider: verification plus normalization.
///
/// Implementations are stateless apart from their secret; one instance
/// serves all tenants of that provider.
pub trait WebhookProvider: Send + Sync {
    /// Stable provider name; doubles as the event `source`.
    fn name(&self) -> &'static str;

    /// Extract the tenant key (shop domain) from the headers.
    ///
    /// # Errors
    ///
    /// Returns [`IngressError::MissingHeader`] when the provider's tenant
    /// header is absent.
    fn shop_domain(&self, headers: &HeaderMap) -> Result<String, IngressError>;

    /// Extract the provider's event topic (e.g. `orders/create`).
    ///
    /// `path_topic` is the URL remainder after the provider segment, used
    /// when the provider does not carry a topic header.
    ///
    /// # Errors
    ///
    /// Returns [`IngressError::MissingHeader`] when neither a topic header
    /// nor a path topic is available.
    fn topic(&self, headers: &HeaderMap, path_topic: &str) -> Result<String, IngressError>;

    /// Verify the signature over the raw body.
    ///
    /// # Errors
    ///
    /// Returns [`IngressError::InvalidSignature`] on mismatch and header
    /// errors when the signature header is absent or malformed.
    fn verify(&self, headers: &HeaderMap, raw_body: &[u8]) -> Result<(), IngressError>;

    /// Normalize a verified payload into a canonical event.
    ///
    /// # Errors
    ///
    /// Returns [`IngressError::Normalization`] when the payload cannot be
    /// mapped.
    fn normalize(
        &self,
        topic: &str,
        raw_body: &[u8],
        tenant: &Tenant,
    ) -> Result<Event, IngressError>;
}

/// Read a required header as UTF-8.
pub(crate) fn require_header<'a>(
    headers: &'a HeaderMap,
    name: &'static str,
) -> Result<&'a str, IngressError> {
    headers
        .get(name)
        .ok_or(IngressError::MissingHeader(name))?
        .to_str()
        .map_err(|e| IngressError::MalformedHeader {
            header: name,
            reason: e.to_string(),
        })
}

fn hmac_sha256(secret: &[u8], message: &[u8]) -> Result<Vec<u8>, IngressError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|e| {
        IngressError::Normalization(format!("invalid webhook secret length: {e}"))
    })?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Verify a Base64-encoded HMAC-SHA256 signature over `message`.
///
/// # Errors
///
/// Returns [`IngressError::InvalidSignature`] on decode failure or
/// mismatch; the comparison itself is constant-time.
pub fn verify_base64_hmac(
    secret: &[u8],
    message: &[u8],
    provided: &str,
) -> Result<(), IngressError> {
    let expected = hmac_sha256(secret, message)?;
    let provided = base64::engine::general_purpose::STANDARD
        .decode(provided)
        .map_err(|_| IngressError::InvalidSignature)?;
    if constant_time_eq(&expected, &provided) {
        Ok(())
    } else {
        Err(IngressError::InvalidSignature)
    }
}

/// Verify a hex-encoded HMAC-SHA256 signature over `message`.
///
/// # Errors
///
/// Returns [`IngressError::InvalidSignature`] on decode failure or
/// mismatch; the comparison itself is constant-time.
pub fn verify_hex_hmac(secret: &[u8], message: &[u8], provided: &str) -> Result<(), IngressError> {
    let expected = hmac_sha256(secret, message)?;
    let provided = hex::decode(provided).map_err(|_| IngressError::InvalidSignature)?;
    if constant_time_eq(&expected, &provided) {
        Ok(())
    } else {
        Err(IngressError::InvalidSignature)
    }
}

/// Compute the Base64 HMAC-SHA256 of a message (test and tooling helper).
#[must_use]
pub fn sign_base64(secret: &[u8], message: &[u8]) -> String {
    // The secret length is never invalid for SHA-256 HMAC.
    let signature = hmac_sha256(secret, message).unwrap_or_default();
    base64::engine::general_purpose::STANDARD.encode(signature)
}

/// Compute the hex HMAC-SHA256 of a message (test and tooling helper).
#[must_use]
pub fn sign_hex(secret: &[u8], message: &[u8]) -> String {
    let signature = hmac_sha256(secret, message).unwrap_or_default();
    hex::encode(signature)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn base64_signature_roundtrip() {
        let secret = b"whsec_test";
        let body = br#"{"id":1001}"#;
        let signature = sign_base64(secret, body);
        assert!(verify_base64_hmac(secret, body, &signature).is_ok());
    }

    #[test]
    fn tampered_body_fails_verification() {
        let secret = b"whsec_test";
        let signature = sign_base64(secret, br#"{"id":1001}"#);
        assert!(matches!(
            verify_base64_hmac(secret, br#"{"id":9999}"#, &signature),
            Err(IngressError::InvalidSignature)
        ));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let body = br#"{"id":1001}"#;
        let signature = sign_base64(b"right", body);
        assert!(verify_base64_hmac(b"wrong", body, &signature).is_err());
    }

    #[test]
    fn garbage_encoding_fails_closed() {
        assert!(verify_base64_hmac(b"secret", b"body", "!!! not base64 !!!").is_err());
        assert!(verify_hex_hmac(b"secret", b"body", "zz-not-hex").is_err());
    }

    #[test]
    fn hex_signature_roundtrip() {
        let secret = b"whsec_test";
        let body = b"t=123.{}";
        let signature = sign_hex(secret, body);
        assert!(verify_hex_hmac(secret, body, &signature).is_ok());
    }
}
