//! Typed payloads for the commerce event kinds the pipeline knows about.
//!
//! The bus and store treat `data` as opaque JSON; ingress normalization and
//! the materializer's render context work with these typed shapes instead of
//! poking at raw values. Unknown kinds stay raw and remain routable.

use serde::{Deserialize, Serialize};

/// A purchased line item inside an order event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductLine {
    /// Provider-side product identifier, when the provider exposes one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    /// Display title.
    pub title: String,
    /// Unit price in the order currency.
    pub price: f64,
    /// Units purchased.
    pub quantity: u32,
}

/// Payload of `order.created` (v1.0.0).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    /// Provider order identifier.
    pub order_id: String,
    /// Buyer display name, when the provider shares it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    /// Buyer email, when the provider shares it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Order total in `currency`.
    pub total: f64,
    /// ISO-4217 currency code.
    pub currency: String,
    /// Purchased items.
    pub products: Vec<ProductLine>,
}

/// Payload of `user.registered` (v1.1.0, the latest shape).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRegistered {
    /// New user identifier.
    pub user_id: String,
    /// Registration email.
    pub email: String,
    /// Display name, when collected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// IANA timezone; migrations default this to `UTC`.
    pub timezone: String,
}

/// Payload of `signup.completed` (v1.0.0).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupCompleted {
    /// User who completed signup.
    pub user_id: String,
    /// Plan chosen at signup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    /// Attribution, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
}

/// A decoded event payload, discriminated by the owning event type.
#[derive(Clone, Debug, PartialEq)]
pub enum EventData {
    /// `order.created`
    OrderCreated(OrderCreated),
    /// `user.registered`
    UserRegistered(UserRegistered),
    /// `signup.completed`
    SignupCompleted(SignupCompleted),
    /// Any kind the pipeline routes but does not model.
    Unknown(serde_json::Value),
}

impl EventData {
    /// Decode a raw payload for the given event type.
    ///
    /// Kinds the pipeline does not model come back as [`EventData::Unknown`];
    /// modeled kinds whose payload fails to decode also fall back to
    /// `Unknown` so callers can still route and store the event - schema
    /// enforcement is the registry's job, not this decoder's.
    #[must_use]
    pub fn decode(event_type: &str, data: &serde_json::Value) -> Self {
        match event_type {
            "order.created" => serde_json::from_value(data.clone())
                .map_or_else(|_| Self::Unknown(data.clone()), Self::OrderCreated),
            "user.registered" => serde_json::from_value(data.clone())
                .map_or_else(|_| Self::Unknown(data.clone()), Self::UserRegistered),
            "signup.completed" => serde_json::from_value(data.clone())
                .map_or_else(|_| Self::Unknown(data.clone()), Self::SignupCompleted),
            _ => Self::Unknown(data.clone()),
        }
    }
}
