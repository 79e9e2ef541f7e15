//! Canonical event type and topic routing.
//!
//! Every signal that enters the pipeline - a webhook, an admin action, a
//! replayed historical record - is normalized into an [`Event`] before it
//! touches the bus. Events are immutable facts: once produced they are never
//! mutated, only migrated forward to newer schema versions.
//!
//! # Wire format
//!
//! Events are serialized as JSON with camelCase keys so the same body can be
//! read by the bus consumers, the event store, and the browser widgets
//! without translation.
//!
//! # Topic routing
//!
//! An event maps to exactly one primary topic, derived from the first
//! segment of its type: `user.registered` → `user-events`,
//! `order.created` → `order-events`. See [`topic_for`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A canonical pipeline event.
///
/// The `event_type` + `version` pair determines the shape of `data`; the
/// [`SchemaRegistry`](crate::schema::SchemaRegistry) owns that contract and
/// can migrate older versions forward.
///
/// # Invariants
///
/// - `id` is globally unique (UUID v4 unless supplied by the producer).
/// - `correlation_id` groups causally related events.
/// - `timestamp` is UTC; monotonicity per source is preferred, not required.
///
/// # Examples
///
/// ```
/// use proofpulse_core::event::Event;
/// use serde_json::json;
///
/// let event = Event::new(
///     "order.created",
///     "1.0.0",
///     "shopify",
///     "org-1",
///     json!({ "orderId": "1001", "total": 49.99 }),
/// )
/// .with_site_id("site-1")
/// .with_correlation_id("corr-7");
///
/// assert_eq!(event.event_type, "order.created");
/// assert_eq!(event.topic(), "order-events");
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Globally unique event identifier.
    pub id: String,

    /// Event type in `domain.action` form (e.g. `order.created`).
    #[serde(rename = "type")]
    pub event_type: String,

    /// Schema version of `data`, as a semver string.
    pub version: String,

    /// When the event happened, UTC.
    pub timestamp: DateTime<Utc>,

    /// Originating system (`shopify`, `woocommerce`, `stripe`, `replay`, …).
    pub source: String,

    /// Owning organization (tenant).
    pub organization_id: String,

    /// Site within the organization, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,

    /// End user the event concerns, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Browser session, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Groups causally related events across the pipeline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Free-form metadata attached by producers and migrations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,

    /// Kind-specific payload; shape is owned by `event_type` + `version`.
    pub data: serde_json::Value,
}

impl Event {
    /// Create a new event with a generated id and the current timestamp.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        version: impl Into<String>,
        source: impl Into<String>,
        organization_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            version: version.into(),
            timestamp: Utc::now(),
            source: source.into(),
            organization_id: organization_id.into(),
            site_id: None,
            user_id: None,
            session_id: None,
            correlation_id: None,
            metadata: None,
            data,
        }
    }

    /// Set the site id.
    #[must_use]
    pub fn with_site_id(mut self, site_id: impl Into<String>) -> Self {
        self.site_id = Some(site_id.into());
        self
    }

    /// Set the user id.
    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the session id.
    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Attach metadata, merging over any existing object.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        match (&mut self.metadata, metadata) {
            (Some(serde_json::Value::Object(existing)), serde_json::Value::Object(incoming)) => {
                existing.extend(incoming);
            }
            (slot, incoming) => *slot = Some(incoming),
        }
        self
    }

    /// The primary bus topic this event routes to.
    #[must_use]
    pub fn topic(&self) -> String {
        topic_for(&self.event_type)
    }

    /// Partition key: the organization id, falling back to the event id so
    /// orphan events still partition deterministically.
    #[must_use]
    pub fn partition_key(&self) -> &str {
        if self.organization_id.is_empty() {
            &self.id
        } else {
            &self.organization_id
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event {{ id: {}, type: {}@{}, org: {} }}",
            self.id, self.event_type, self.version, self.organization_id
        )
    }
}

/// Derive the primary bus topic for an event type.
///
/// The rule is deterministic: the segment before the first `.` becomes the
/// topic prefix, suffixed with `-events`. Types without a dot fall into the
/// `general-events` topic.
///
/// # Examples
///
/// ```
/// use proofpulse_core::event::topic_for;
///
/// assert_eq!(topic_for("user.registered"), "user-events");
/// assert_eq!(topic_for("notification.delivered"), "notification-events");
/// assert_eq!(topic_for("heartbeat"), "general-events");
/// ```
#[must_use]
pub fn topic_for(event_type: &str) -> String {
    match event_type.split_once('.') {
        Some((prefix, _)) if !prefix.is_empty() => format!("{prefix}-events"),
        _ => "general-events".to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_event_generates_unique_ids() {
        let a = Event::new("order.created", "1.0.0", "test", "org-1", json!({}));
        let b = Event::new("order.created", "1.0.0", "test", "org-1", json!({}));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn topic_derivation_follows_prefix_rule() {
        assert_eq!(topic_for("user.registered"), "user-events");
        assert_eq!(topic_for("order.created"), "order-events");
        assert_eq!(topic_for("notification.delivered"), "notification-events");
        assert_eq!(topic_for("signup.completed"), "signup-events");
    }

    #[test]
    fn topic_derivation_handles_degenerate_types() {
        assert_eq!(topic_for("heartbeat"), "general-events");
        assert_eq!(topic_for(".odd"), "general-events");
        assert_eq!(topic_for(""), "general-events");
    }

    #[test]
    fn partition_key_prefers_organization() {
        let event = Event::new("order.created", "1.0.0", "test", "org-1", json!({}));
        assert_eq!(event.partition_key(), "org-1");

        let orphan = Event::new("order.created", "1.0.0", "test", "", json!({}));
        assert_eq!(orphan.partition_key(), orphan.id);
    }

    #[test]
    fn json_wire_format_uses_camel_case() {
        let event = Event::new("order.created", "1.0.0", "shopify", "org-1", json!({"a": 1}))
            .with_site_id("site-1");

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "order.created");
        assert_eq!(value["organizationId"], "org-1");
        assert_eq!(value["siteId"], "site-1");
        assert!(value.get("userId").is_none(), "unset options are omitted");
    }

    #[test]
    fn json_roundtrip_preserves_event() {
        let event = Event::new("user.registered", "1.1.0", "web", "org-2", json!({"x": true}))
            .with_user_id("u-1")
            .with_correlation_id("c-1");

        let text = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&text).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn metadata_merges_objects() {
        let event = Event::new("order.created", "1.0.0", "test", "org-1", json!({}))
            .with_metadata(json!({"a": 1}))
            .with_metadata(json!({"b": 2}));

        let meta = event.metadata.unwrap();
        assert_eq!(meta["a"], 1);
        assert_eq!(meta["b"], 2);
    }
}
