//! Notification materializer for ProofPulse.
//!
//! Consumes canonical events and turns them into per-site notifications:
//! template lookup, delivery-rule evaluation (targeting, frequency caps,
//! user preferences, business hours), A/B variant selection, sanitized
//! template rendering, and priority enqueueing - one notification per
//! active template, each with an independent lifecycle.
//!
//! ```text
//!                   ┌────────────────────────────────────────────┐
//!  Event ──────────>│ Materializer                               │
//!                   │   templates (TemplateStore)                │
//!                   │   rules     (RuleEngine, fail-open)        │
//!                   │   A/B       (stable hash bucketing)        │
//!                   │   render    (tera + sanitizer + caches)    │
//!                   │   enqueue   (PriorityQueue, per channel)   │
//!                   └────────────────────────────────────────────┘
//!                        │ delivered        │ filtered/failed
//!                   queue:<channel>     analytics only
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod abtest;
pub mod cache;
pub mod error;
pub mod materializer;
pub mod model;
pub mod render;
pub mod rules;
pub mod sanitize;
pub mod store;

pub use error::MaterializerError;
pub use materializer::{AnalyticsRecord, AnalyticsSink, DeliveryOutcome, Materializer};
pub use model::{
    AbTest, Notification, NotificationStatus, RenderedContent, Template, TargetingRules,
};
pub use render::{Renderer, RendererConfig, TemplateValidation};
pub use rules::{FilterReason, RuleDecision, RuleEngine, RulePolicies};
pub use store::{BusinessHours, InMemoryTemplateStore, TemplateStore, UserPreferences};
