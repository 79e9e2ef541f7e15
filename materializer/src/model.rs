//! Templates, targeting rules, and the notification lifecycle.

use crate::error::MaterializerError;
use chrono::{DateTime, Utc};
use proofpulse_queue::Priority;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Comparison operator for one targeting condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetingOp {
    /// Field equals the value.
    Eq,
    /// Field differs from the value.
    Ne,
    /// Field is numerically greater.
    Gt,
    /// Field is numerically greater or equal.
    Gte,
    /// Field is numerically smaller.
    Lt,
    /// Field is numerically smaller or equal.
    Lte,
    /// String field (or array) contains the value.
    Contains,
    /// Field is present (value ignored).
    Exists,
}

/// One predicate over the event data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetingCondition {
    /// Dotted path into the event data (`total`, `products.0.title`).
    pub field: String,
    /// Comparison operator.
    pub op: TargetingOp,
    /// Comparand; ignored for `Exists`.
    #[serde(default)]
    pub value: serde_json::Value,
}

/// How multiple conditions combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetingMode {
    /// Every condition must hold.
    #[default]
    All,
    /// At least one condition must hold.
    Any,
}

/// Targeting rules attached to a template.
///
/// An empty condition list matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetingRules {
    /// Combination mode.
    #[serde(default)]
    pub mode: TargetingMode,
    /// The conditions.
    #[serde(default)]
    pub conditions: Vec<TargetingCondition>,
}

fn lookup<'a>(data: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = data;
    for segment in path.split('.') {
        current = match current {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn compare_numbers(
    field: &serde_json::Value,
    value: &serde_json::Value,
    op: TargetingOp,
) -> bool {
    let (Some(a), Some(b)) = (field.as_f64(), value.as_f64()) else {
        return false;
    };
    match op {
        TargetingOp::Gt => a > b,
        TargetingOp::Gte => a >= b,
        TargetingOp::Lt => a < b,
        TargetingOp::Lte => a <= b,
        _ => false,
    }
}

impl TargetingRules {
    /// Evaluate the rules against event data.
    #[must_use]
    pub fn matches(&self, data: &serde_json::Value) -> bool {
        if self.conditions.is_empty() {
            return true;
        }
        let mut hits = self
            .conditions
            .iter()
            .map(|condition| Self::condition_matches(condition, data));
        match self.mode {
            TargetingMode::All => hits.all(|hit| hit),
            TargetingMode::Any => hits.any(|hit| hit),
        }
    }

    fn condition_matches(condition: &TargetingCondition, data: &serde_json::Value) -> bool {
        let field = lookup(data, &condition.field);
        match condition.op {
            TargetingOp::Exists => field.is_some(),
            TargetingOp::Eq => field == Some(&condition.value),
            TargetingOp::Ne => field != Some(&condition.value),
            TargetingOp::Gt | TargetingOp::Gte | TargetingOp::Lt | TargetingOp::Lte => field
                .is_some_and(|field| compare_numbers(field, &condition.value, condition.op)),
            TargetingOp::Contains => field.is_some_and(|field| match field {
                serde_json::Value::String(s) => condition
                    .value
                    .as_str()
                    .is_some_and(|needle| s.contains(needle)),
                serde_json::Value::Array(items) => items.contains(&condition.value),
                _ => false,
            }),
        }
    }
}

/// A site-scoped notification template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    /// Template id.
    pub id: String,
    /// Owning site.
    pub site_id: String,
    /// Event type this template fires for.
    pub event_type: String,
    /// Delivery channels to enqueue on.
    pub channels: Vec<String>,
    /// HTML body (template source).
    pub html: String,
    /// Stylesheet delivered with the widget.
    pub css: String,
    /// Optional text body template; derived from HTML when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_fallback: Option<String>,
    /// Optional subject template (email-style channels).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Targeting rules; empty matches everything.
    #[serde(default)]
    pub targeting: TargetingRules,
    /// Attached A/B test, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ab_test_id: Option<String>,
    /// Queue priority for this template's notifications.
    #[serde(default = "default_priority")]
    pub priority: Priority,
    /// Inactive templates never fire.
    pub active: bool,
    /// Version discriminator for the compiled-template cache.
    pub updated_at: DateTime<Utc>,
}

const fn default_priority() -> Priority {
    Priority::Normal
}

impl Template {
    /// Cache key combining id and version.
    #[must_use]
    pub fn cache_key(&self) -> String {
        format!("{}@{}", self.id, self.updated_at.timestamp_millis())
    }
}

/// An A/B test routing a share of traffic to a variant template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbTest {
    /// Test id.
    pub id: String,
    /// Site the test belongs to.
    pub site_id: String,
    /// Control template.
    pub template_id: String,
    /// Variant template replacing the control for selected traffic.
    pub variant_template_id: String,
    /// Percentage of traffic (0–100) routed to the variant.
    pub traffic_split: u8,
    /// Inactive tests are ignored.
    pub active: bool,
}

/// Notification lifecycle status.
///
/// The DAG is fixed and one-way: `pending → (filtered | delivered |
/// failed)`. Terminal statuses never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    /// Created, not yet decided.
    Pending,
    /// Rejected by delivery rules.
    Filtered,
    /// Handed to the delivery fan-out.
    Delivered,
    /// Render or enqueue failed.
    Failed,
}

impl NotificationStatus {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Filtered => "filtered",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Rendered notification content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedContent {
    /// Sanitized HTML.
    pub html: String,
    /// Stylesheet.
    pub css: String,
    /// Plain-text body, when available or derivable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Rendered subject line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Render provenance.
    pub metadata: RenderMetadata,
}

/// Provenance attached to rendered content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderMetadata {
    /// Template that produced the content.
    pub template_id: String,
    /// When it was rendered.
    pub rendered_at: DateTime<Utc>,
    /// Wall-clock render time in milliseconds.
    pub render_time_ms: u64,
}

/// A materialized notification record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Notification id.
    pub id: String,
    /// Owning site.
    pub site_id: String,
    /// Template that produced it.
    pub template_id: String,
    /// Event type it materialized from.
    pub event_type: String,
    /// Channels it targets.
    pub channels: Vec<String>,
    /// Lifecycle status.
    pub status: NotificationStatus,
    /// Rendered content, present once rendering succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<RenderedContent>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// Create a pending notification for a template.
    #[must_use]
    pub fn pending(template: &Template) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            site_id: template.site_id.clone(),
            template_id: template.id.clone(),
            event_type: template.event_type.clone(),
            channels: template.channels.clone(),
            status: NotificationStatus::Pending,
            content: None,
            created_at: Utc::now(),
        }
    }

    /// Transition to a new status, enforcing the one-way DAG.
    ///
    /// # Errors
    ///
    /// Returns [`MaterializerError::InvalidTransition`] when the current
    /// status is terminal.
    pub fn transition(&mut self, to: NotificationStatus) -> Result<(), MaterializerError> {
        if self.status.is_terminal() {
            return Err(MaterializerError::InvalidTransition {
                from: self.status.as_str(),
                to: to.as_str(),
            });
        }
        self.status = to;
        Ok(())
    }
}
