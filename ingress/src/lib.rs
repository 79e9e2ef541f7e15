//! Webhook ingress for ProofPulse.
//!
//! Commerce platforms push webhooks here; ProofPulse verifies them against
//! the provider's HMAC scheme, resolves the tenant from the shop domain,
//! normalizes the payload into a canonical event, and hands it to the bus
//! producer.
//!
//! ```text
//! POST /webhooks/shopify/orders/create
//!   │ raw body captured
//!   ├─ headers present?          ── no ──> 400
//!   ├─ HMAC matches raw body?    ── no ──> 401
//!   └─ authentic ────────────────────────> 200, always
//!        ├─ tenant lookup (ShopDirectory)
//!        ├─ normalize → Event (order.created, user.registered, …)
//!        └─ produce → bus          (failures logged, retried internally)
//! ```
//!
//! Providers implement the [`provider::WebhookProvider`] capability set
//! (`verify` + `normalize`); Shopify, WooCommerce, and Stripe ship here.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod directory;
pub mod error;
pub mod provider;
pub mod routes;
pub mod shopify;
pub mod stripe;
pub mod woocommerce;

pub use directory::{ShopDirectory, StaticShopDirectory};
pub use error::IngressError;
pub use provider::{Tenant, WebhookProvider};
pub use routes::{router, EventSink, IngressState};
pub use shopify::ShopifyProvider;
pub use stripe::StripeProvider;
pub use woocommerce::WooCommerceProvider;
