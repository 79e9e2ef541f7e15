//! Shopify webhook provider.
//!
//! Headers: `x-shopify-shop-domain` (tenant), `x-shopify-hmac-sha256`
//! (Base64 HMAC over the raw body), `x-shopify-topic` (`orders/create`,
//! `customers/create`, …).

use crate::error::IngressError;
use crate::provider::{require_header, verify_base64_hmac, Tenant, WebhookProvider};
use http::HeaderMap;
use proofpulse_core::payload::{OrderCreated, ProductLine};
use proofpulse_core::Event;
use serde::Deserialize;

const SHOP_DOMAIN_HEADER: &str = "x-shopify-shop-domain";
const HMAC_HEADER: &str = "x-shopify-hmac-sha256";
const TOPIC_HEADER: &str = "x-shopify-topic";

/// Shopify provider configured with the shop's shared webhook secret.
pub struct ShopifyProvider {
    secret: Vec<u8>,
}

impl ShopifyProvider {
    /// Create a provider with the webhook signing secret.
    #[must_use]
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

/// Shopify order payload, as delivered on `orders/create`.
#[derive(Debug, Deserialize)]
struct ShopifyOrder {
    id: serde_json::Value,
    email: Option<String>,
    customer: Option<ShopifyCustomer>,
    total_price: String,
    currency: String,
    #[serde(default)]
    line_items: Vec<ShopifyLineItem>,
}

#[derive(Debug, Deserialize)]
struct ShopifyCustomer {
    first_name: Option<String>,
    last_name: Option<String>,
    id: Option<serde_json::Value>,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ShopifyLineItem {
    product_id: Option<serde_json::Value>,
    title: String,
    price: String,
    #[serde(default = "default_quantity")]
    quantity: u32,
}

const fn default_quantity() -> u32 {
    1
}

fn display_name(customer: Option<&ShopifyCustomer>) -> Option<String> {
    let customer = customer?;
    match (&customer.first_name, &customer.last_name) {
        (Some(first), Some(last)) => Some(format!("{first} {last}")),
        (Some(first), None) => Some(first.clone()),
        (None, Some(last)) => Some(last.clone()),
        (None, None) => None,
    }
}

fn parse_money(raw: &str, field: &str) -> Result<f64, IngressError> {
    raw.parse()
        .map_err(|_| IngressError::Normalization(format!("unparseable {field}: {raw:?}")))
}

impl WebhookProvider for ShopifyProvider {
    fn name(&self) -> &'static str {
        "shopify"
    }

    fn shop_domain(&self, headers: &HeaderMap) -> Result<String, IngressError> {
        Ok(require_header(headers, SHOP_DOMAIN_HEADER)?.to_string())
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
        let provided = require_header(headers, HMAC_HEADER)?;
        verify_base64_hmac(&self.secret, raw_body, provided)
    }

    fn normalize(
        &self,
        topic: &str,
        raw_body: &[u8],
        tenant: &Tenant,
    ) -> Result<Event, IngressError> {
        match topic {
            "orders/create" | "orders/paid" => self.normalize_order(raw_body, tenant),
            "customers/create" => self.normalize_customer(raw_body, tenant),
            other => Err(IngressError::Normalization(format!(
                "unsupported shopify topic: {other}"
            ))),
        }
    }
}

impl ShopifyProvider {
    fn normalize_order(&self, raw_body: &[u8], tenant: &Tenant) -> Result<Event, IngressError> {
        let order: ShopifyOrder = serde_json::from_slice(raw_body)
            .map_err(|e| IngressError::Normalization(format!("bad order payload: {e}")))?;

        let products = order
            .line_items
            .iter()
            .map(|item| {
                Ok(ProductLine {
                    product_id: item.product_id.as_ref().map(json_id),
                    title: item.title.clone(),
                    price: parse_money(&item.price, "line item price")?,
                    quantity: item.quantity,
                })
            })
            .collect::<Result<Vec<_>, IngressError>>()?;

        let data = OrderCreated {
            order_id: json_id(&order.id),
            customer_name: display_name(order.customer.as_ref()),
            email: order.email.clone(),
            total: parse_money(&order.total_price, "total price")?,
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

    fn normalize_customer(&self, raw_body: &[u8], tenant: &Tenant) -> Result<Event, IngressError> {
        let customer: ShopifyCustomer = serde_json::from_slice(raw_body)
            .map_err(|e| IngressError::Normalization(format!("bad customer payload: {e}")))?;

        let user_id = customer
            .id
            .as_ref()
            .map(json_id)
            .ok_or_else(|| IngressError::Normalization("customer without id".to_string()))?;
        let email = customer
            .email
            .clone()
            .ok_or_else(|| IngressError::Normalization("customer without email".to_string()))?;

        // Emitted at 1.0.0; the schema registry migrates it forward and
        // fills the timezone default on produce.
        let mut data = serde_json::json!({
            "userId": user_id.clone(),
            "email": email,
        });
        if let Some(name) = display_name(Some(&customer)) {
            data["name"] = serde_json::Value::String(name);
        }

        Ok(Event::new(
            "user.registered",
            "1.0.0",
            self.name(),
            &tenant.organization_id,
            data,
        )
        .with_site_id(&tenant.site_id)
        .with_user_id(user_id))
    }
}

/// Provider ids arrive as numbers or strings; normalize to a string.
fn json_id(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::provider::sign_base64;
    use http::HeaderValue;

    const SECRET: &[u8] = b"shpss_test_secret";

    fn tenant() -> Tenant {
        Tenant {
            shop_domain: "shop.myshopify.com".to_string(),
            organization_id: "org-1".to_string(),
            site_id: "site-1".to_string(),
        }
    }

    fn order_body() -> &'static [u8] {
        br#"{"id":1001,"email":"c@x.com","customer":{"first_name":"Ana"},"total_price":"49.99","currency":"USD","line_items":[{"product_id":11,"title":"Mug","price":"49.99","quantity":1}]}"#
    }

    #[test]
    fn verifies_valid_signature() {
        let provider = ShopifyProvider::new(SECRET);
        let mut headers = HeaderMap::new();
        let signature = sign_base64(SECRET, order_body());
        headers.insert("x-shopify-hmac-sha256", HeaderValue::from_str(&signature).unwrap());

        assert!(provider.verify(&headers, order_body()).is_ok());
    }

    #[test]
    fn rejects_bad_signature() {
        let provider = ShopifyProvider::new(SECRET);
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-shopify-hmac-sha256",
            HeaderValue::from_static("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="),
        );

        assert!(matches!(
            provider.verify(&headers, order_body()),
            Err(IngressError::InvalidSignature)
        ));
    }

    #[test]
    fn missing_hmac_header_is_explicit() {
        let provider = ShopifyProvider::new(SECRET);
        assert!(matches!(
            provider.verify(&HeaderMap::new(), order_body()),
            Err(IngressError::MissingHeader("x-shopify-hmac-sha256"))
        ));
    }

    #[test]
    fn normalizes_order_created() {
        let provider = ShopifyProvider::new(SECRET);
        let event = provider
            .normalize("orders/create", order_body(), &tenant())
            .unwrap();

        assert_eq!(event.event_type, "order.created");
        assert_eq!(event.version, "1.0.0");
        assert_eq!(event.source, "shopify");
        assert_eq!(event.organization_id, "org-1");
        assert_eq!(event.site_id.as_deref(), Some("site-1"));
        assert_eq!(event.data["orderId"], "1001");
        assert_eq!(event.data["customerName"], "Ana");
        assert_eq!(event.data["currency"], "USD");
        assert_eq!(event.data["products"][0]["title"], "Mug");
        assert_eq!(event.topic(), "order-events");
    }

    #[test]
    fn normalizes_customer_created_at_v1() {
        let provider = ShopifyProvider::new(SECRET);
        let body = br#"{"id":501,"email":"new@x.com","first_name":"Bo","last_name":"Li"}"#;
        let event = provider
            .normalize("customers/create", body, &tenant())
            .unwrap();

        assert_eq!(event.event_type, "user.registered");
        assert_eq!(event.version, "1.0.0");
        assert_eq!(event.data["userId"], "501");
        assert_eq!(event.data["name"], "Bo Li");
        assert_eq!(event.user_id.as_deref(), Some("501"));
    }

    #[test]
    fn unsupported_topic_is_a_normalization_error() {
        let provider = ShopifyProvider::new(SECRET);
        assert!(provider
            .normalize("fulfillments/create", b"{}", &tenant())
            .is_err());
    }

    #[test]
    fn unparseable_total_is_rejected() {
        let provider = ShopifyProvider::new(SECRET);
        let body = br#"{"id":1,"total_price":"forty-nine","currency":"USD"}"#;
        assert!(provider.normalize("orders/create", body, &tenant()).is_err());
    }
}
