//! Stripe webhook provider.
//!
//! Stripe signs with a timestamped scheme: the `stripe-signature` header
//! carries `t=<unix>,v1=<hex>` and the signature covers `"{t}.{raw_body}"`.
//! Signatures older than the replay window are rejected even when they
//! verify. Tenancy comes from the `stripe-account` header on connected
//! accounts, falling back to the platform account.

use crate::error::IngressError;
use crate::provider::{require_header, verify_hex_hmac, Tenant, WebhookProvider};
use chrono::Utc;
use http::HeaderMap;
use proofpulse_core::Event;
use serde::Deserialize;

const SIGNATURE_HEADER: &str = "stripe-signature";
const ACCOUNT_HEADER: &str = "stripe-account";
/// Platform-account tenant key used when no connected account is present.
const PLATFORM_TENANT: &str = "stripe";
/// Reject signatures older than five minutes.
const REPLAY_WINDOW_SECS: i64 = 300;

/// Stripe provider configured with the endpoint signing secret.
pub struct StripeProvider {
    secret: Vec<u8>,
}

impl StripeProvider {
    /// Create a provider with the endpoint secret (`whsec_…`).
    #[must_use]
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StripeEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: StripeData,
}

#[derive(Debug, Deserialize)]
struct StripeData {
    object: serde_json::Value,
}

struct SignatureParts {
    timestamp: i64,
    v1: String,
}

fn parse_signature(header: &str) -> Result<SignatureParts, IngressError> {
    let mut timestamp = None;
    let mut v1 = None;
    for pair in header.split(',') {
        match pair.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => v1 = Some(value.to_string()),
            _ => {}
        }
    }
    match (timestamp, v1) {
        (Some(timestamp), Some(v1)) => Ok(SignatureParts { timestamp, v1 }),
        _ => Err(IngressError::MalformedHeader {
            header: SIGNATURE_HEADER,
            reason: "expected t=<unix>,v1=<hex>".to_string(),
        }),
    }
}

impl WebhookProvider for StripeProvider {
    fn name(&self) -> &'static str {
        "stripe"
    }

    fn shop_domain(&self, headers: &HeaderMap) -> Result<String, IngressError> {
        Ok(require_header(headers, ACCOUNT_HEADER)
            .map_or_else(|_| PLATFORM_TENANT.to_string(), ToString::to_string))
    }

    fn topic(&self, _headers: &HeaderMap, path_topic: &str) -> Result<String, IngressError> {
        // Stripe carries the event type in the body envelope; the path is
        // only a fallback hint and may be empty.
        Ok(path_topic.to_string())
    }

    fn verify(&self, headers: &HeaderMap, raw_body: &[u8]) -> Result<(), IngressError> {
        let header = require_header(headers, SIGNATURE_HEADER)?;
        let parts = parse_signature(header)?;

        let age = Utc::now().timestamp() - parts.timestamp;
        if age.abs() > REPLAY_WINDOW_SECS {
            return Err(IngressError::StaleSignature);
        }

        let mut signed_payload = parts.timestamp.to_string().into_bytes();
        signed_payload.push(b'.');
        signed_payload.extend_from_slice(raw_body);
        verify_hex_hmac(&self.secret, &signed_payload, &parts.v1)
    }

    fn normalize(
        &self,
        _topic: &str,
        raw_body: &[u8],
        tenant: &Tenant,
    ) -> Result<Event, IngressError> {
        let envelope: StripeEnvelope = serde_json::from_slice(raw_body)
            .map_err(|e| IngressError::Normalization(format!("bad stripe envelope: {e}")))?;

        let event_type = map_event_type(&envelope.event_type);
        let data = match event_type.as_str() {
            "order.created" => {
                let object = &envelope.data.object;
                #[allow(clippy::cast_precision_loss)] // Money amounts stay far below 2^53 cents.
                let total = object
                    .get("amount_total")
                    .and_then(serde_json::Value::as_i64)
                    .map_or(0.0, |cents| cents as f64 / 100.0);
                let mut data = serde_json::json!({
                    "orderId": object.get("id").cloned().unwrap_or_default(),
                    "total": total,
                    "currency": object
                        .get("currency")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("usd")
                        .to_uppercase(),
                    "products": [],
                });
                // Optional fields stay absent rather than null so the
                // payload schema keeps its string types.
                if let Some(email) = object.pointer("/customer_details/email") {
                    data["email"] = email.clone();
                }
                if let Some(name) = object.pointer("/customer_details/name") {
                    data["customerName"] = name.clone();
                }
                data
            }
            _ => envelope.data.object.clone(),
        };

        Ok(Event::new(
            event_type,
            "1.0.0",
            self.name(),
            &tenant.organization_id,
            data,
        )
        .with_site_id(&tenant.site_id)
        .with_correlation_id(envelope.id))
    }
}

/// Map Stripe's event names into the pipeline's `domain.action` space.
fn map_event_type(stripe_type: &str) -> String {
    match stripe_type {
        "checkout.session.completed" => "order.created".to_string(),
        "customer.created" => "user.registered".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::provider::sign_hex;
    use http::HeaderValue;

    const SECRET: &[u8] = b"whsec_test";

    fn signed_headers(body: &[u8], timestamp: i64) -> HeaderMap {
        let mut signed = timestamp.to_string().into_bytes();
        signed.push(b'.');
        signed.extend_from_slice(body);
        let signature = sign_hex(SECRET, &signed);

        let mut headers = HeaderMap::new();
        headers.insert(
            "stripe-signature",
            HeaderValue::from_str(&format!("t={timestamp},v1={signature}")).unwrap(),
        );
        headers
    }

    #[test]
    fn fresh_signature_verifies() {
        let provider = StripeProvider::new(SECRET);
        let body = br#"{"id":"evt_1"}"#;
        let headers = signed_headers(body, Utc::now().timestamp());
        assert!(provider.verify(&headers, body).is_ok());
    }

    #[test]
    fn stale_signature_is_rejected_even_when_valid() {
        let provider = StripeProvider::new(SECRET);
        let body = br#"{"id":"evt_1"}"#;
        let headers = signed_headers(body, Utc::now().timestamp() - 3600);
        assert!(matches!(
            provider.verify(&headers, body),
            Err(IngressError::StaleSignature)
        ));
    }

    #[test]
    fn malformed_signature_header_is_explicit() {
        let provider = StripeProvider::new(SECRET);
        let mut headers = HeaderMap::new();
        headers.insert("stripe-signature", HeaderValue::from_static("v1only"));
        assert!(matches!(
            provider.verify(&headers, b"{}"),
            Err(IngressError::MalformedHeader { .. })
        ));
    }

    #[test]
    fn checkout_session_becomes_order_created() {
        let provider = StripeProvider::new(SECRET);
        let tenant = Tenant {
            shop_domain: "stripe".to_string(),
            organization_id: "org-3".to_string(),
            site_id: "site-3".to_string(),
        };
        let body = br#"{"id":"evt_9","type":"checkout.session.completed","data":{"object":{"id":"cs_1","amount_total":4999,"currency":"usd","customer_details":{"email":"a@x.com","name":"Ana"}}}}"#;

        let event = provider.normalize("", body, &tenant).unwrap();
        assert_eq!(event.event_type, "order.created");
        assert_eq!(event.correlation_id.as_deref(), Some("evt_9"));
        assert_eq!(event.data["total"], 49.99);
        assert_eq!(event.data["currency"], "USD");
    }

    #[test]
    fn unmapped_types_pass_through() {
        assert_eq!(map_event_type("invoice.paid"), "invoice.paid");
        assert_eq!(map_event_type("customer.created"), "user.registered");
    }
}
