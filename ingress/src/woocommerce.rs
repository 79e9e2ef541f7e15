//! WooCommerce webhook provider.
//!
//! Headers: `x-wc-webhook-source` (store URL, the tenant key),
//! `x-wc-webhook-signature` (Base64 HMAC over the raw body),
//! `x-wc-webhook-topic` (`order.created`, `customer.created`, …).

use crate::error::IngressError;
use crate::provider::{require_header, verify_base64_hmac, Tenant, WebhookProvider};
use http::HeaderMap;
use proofpulse_core::payload::{OrderCreated, ProductLine};
use proofpulse_core::Event;
use serde::Deserialize;

const SOURCE_HEADER: &str = "x-wc-webhook-source";
const SIGNATURE_HEADER: &str = "x-wc-webhook-signature";
const TOPIC_HEADER: &str = "x-wc-webhook-topic";

/// WooCommerce provider configured with the webhook secret.
pub struct WooCommerceProvider {
    secret: Vec<u8>,
}

impl WooCommerceProvider {
    /// Create a provider with the webhook signing secret.
    #[must_use]
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WooOrder {
    id: serde_json::Value,
    total: String,
    currency: String,
    billing: Option<WooBilling>,
    #[serde(default)]
    line_items: Vec<WooLineItem>,
}

#[derive(Debug, Deserialize)]
struct WooBilling {
    first_name: Option<String>,
    last_name: Option<String>,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WooLineItem {
    product_id: Option<serde_json::Value>,
    name: String,
    price: serde_json::Value,
    #[serde(default = "default_quantity")]
    quantity: u32,
}

const fn default_quantity() -> u32 {
    1
}

/// WooCommerce strips the scheme when it reports the store URL; normalize
/// to a bare host so directory lookups are stable.
fn host_of(source: &str) -> String {
    source
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_string()
}

fn number_of(value: &serde_json::Value, field: &str) -> Result<f64, IngressError> {
    match value {
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| IngressError::Normalization(format!("non-finite {field}"))),
        serde_json::Value::String(s) => s
            .parse()
            .map_err(|_| IngressError::Normalization(format!("unparseable {field}: {s:?}"))),
        other => Err(IngressError::Normalization(format!(
            "unexpected {field}: {other}"
        ))),
    }
}

impl WebhookProvider for WooCommerceProvider {
    fn name(&self) -> &'static str {
        "woocommerce"
    }

    fn shop_domain(&self, headers: &HeaderMap) -> Result<String, IngressError> {
        Ok(host_of(require_header(headers, SOURCE_HEADER)?))
    }

    fn topic(&self, headers: &HeaderMap, path_topic: &str) -> Result<String, IngressError> {
        if let Ok(topic) = require_header(headers, TOPIC_HEADER) {
            return Ok(topic.to_string());
        }
        if path_topic.is_empty() {
            return Err(IngressError::MissingHeader(TOPIC_HEADER));
        }
        Ok(path_topic.to_string())
    }

    fn verify(&self, headers: &HeaderMap, raw_body: &[u8]) -> Result<(), IngressError> {
        let provided = require_header(headers, SIGNATURE_HEADER)?;
        verify_base64_hmac(&self.secret, raw_body, provided)
    }

    fn normalize(
        &self,
        topic: &str,
        raw_body: &[u8],
        tenant: &Tenant,
    ) -> Result<Event, IngressError> {
        match topic {
            "order.created" | "order.updated" => {
                let order: WooOrder = serde_json::from_slice(raw_body)
                    .map_err(|e| IngressError::Normalization(format!("bad order payload: {e}")))?;

                let products = order
                    .line_items
                    .iter()
                    .map(|item| {
                        Ok(ProductLine {
                            product_id: item.product_id.as_ref().map(ToString::to_string),
                            title: item.name.clone(),
                            price: number_of(&item.price, "line item price")?,
                            quantity: item.quantity,
                        })
                    })
                    .collect::<Result<Vec<_>, IngressError>>()?;

                let billing = order.billing.as_ref();
                let customer_name = billing.and_then(|b| {
                    match (&b.first_name, &b.last_name) {
                        (Some(first), Some(last)) => Some(format!("{first} {last}")),
                        (Some(first), None) => Some(first.clone()),
                        (None, Some(last)) => Some(last.clone()),
                        (None, None) => None,
                    }
                });

                let data = OrderCreated {
                    order_id: order.id.to_string().trim_matches('"').to_string(),
                    customer_name,
                    email: billing.and_then(|b| b.email.clone()),
                    total: number_of(&serde_json::Value::String(order.total.clone()), "total")?,
                    currency: order.currency.clone(),
                    products,
                };
                let data = serde_json::to_value(&data)
                    .map_err(|e| IngressError::Normalization(e.to_string()))?;

                Ok(Event::new(
                    "order.created",
                    "1.0.0",
                    self.name(),
                    &tenant.organization_id,
                    data,
                )
                .with_site_id(&tenant.site_id))
            }
            other => Err(IngressError::Normalization(format!(
                "unsupported woocommerce topic: {other}"
            ))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::provider::sign_base64;
    use http::HeaderValue;

    const SECRET: &[u8] = b"wc_test_secret";

    fn tenant() -> Tenant {
        Tenant {
            shop_domain: "store.example.com".to_string(),
            organization_id: "org-2".to_string(),
            site_id: "site-2".to_string(),
        }
    }

    #[test]
    fn source_header_is_normalized_to_host() {
        let provider = WooCommerceProvider::new(SECRET);
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-wc-webhook-source",
            HeaderValue::from_static("https://store.example.com/"),
        );
        assert_eq!(provider.shop_domain(&headers).unwrap(), "store.example.com");
    }

    #[test]
    fn signature_verification_uses_raw_body() {
        let provider = WooCommerceProvider::new(SECRET);
        let body = br#"{"id":7}"#;
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-wc-webhook-signature",
            HeaderValue::from_str(&sign_base64(SECRET, body)).unwrap(),
        );

        assert!(provider.verify(&headers, body).is_ok());
        assert!(provider.verify(&headers, br#"{"id":8}"#).is_err());
    }

    #[test]
    fn normalizes_order_created() {
        let provider = WooCommerceProvider::new(SECRET);
        let body = br#"{"id":88,"total":"15.50","currency":"EUR","billing":{"first_name":"Maja","email":"m@x.com"},"line_items":[{"product_id":3,"name":"Tea","price":"15.50","quantity":1}]}"#;

        let event = provider.normalize("order.created", body, &tenant()).unwrap();
        assert_eq!(event.event_type, "order.created");
        assert_eq!(event.source, "woocommerce");
        assert_eq!(event.data["orderId"], "88");
        assert_eq!(event.data["customerName"], "Maja");
        assert_eq!(event.data["total"], 15.5);
        assert_eq!(event.data["products"][0]["title"], "Tea");
    }
}
