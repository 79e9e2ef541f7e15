//! Delivery rule evaluation.
//!
//! Rules run in a fixed order and short-circuit on the first rejection:
//! targeting → frequency cap → user preferences → business hours. The
//! policy for infrastructure failures is fail-open: a broken Redis or
//! store must degrade to "deliver" rather than silently muting every
//! notification on the site.

use crate::error::MaterializerError;
use crate::model::Template;
use crate::store::{BusinessHours, TemplateStore};
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use proofpulse_core::Event;
use proofpulse_queue::{FrequencyLimiter, QueueBackend};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Why a notification was filtered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterReason {
    /// Targeting rules rejected the event data.
    Targeting,
    /// The (site, user) pair is over its frequency cap.
    FrequencyCapped,
    /// The user's preferences mute this notification.
    UserPreferences,
    /// The site is outside its delivery hours.
    BusinessHours,
}

/// Outcome of rule evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleDecision {
    /// Deliver.
    Allow,
    /// Filter, with the deciding rule.
    Filter(FilterReason),
}

/// Tunable rule policies.
#[derive(Debug, Clone)]
pub struct RulePolicies {
    /// Frequency cap per (site, user) within the window.
    pub frequency_limit: u32,
    /// Rolling frequency window.
    pub frequency_window: Duration,
}

impl Default for RulePolicies {
    fn default() -> Self {
        Self {
            frequency_limit: 10,
            frequency_window: Duration::from_secs(60 * 60),
        }
    }
}

/// Sequential, short-circuiting rule engine.
pub struct RuleEngine<S, B: QueueBackend> {
    store: Arc<S>,
    frequency: FrequencyLimiter<B>,
    policies: RulePolicies,
}

impl<S: TemplateStore, B: QueueBackend> RuleEngine<S, B> {
    /// Create an engine over the template store and frequency backend.
    #[must_use]
    pub fn new(store: Arc<S>, frequency: FrequencyLimiter<B>, policies: RulePolicies) -> Self {
        Self {
            store,
            frequency,
            policies,
        }
    }

    /// Evaluate all delivery rules for a template against an event.
    ///
    /// # Errors
    ///
    /// Never fails in practice: rule infrastructure errors are logged and
    /// treated as allows. The `Result` stays in the signature so a future
    /// fail-closed policy is a local change.
    pub async fn evaluate(
        &self,
        template: &Template,
        event: &Event,
    ) -> Result<RuleDecision, MaterializerError> {
        if !template.targeting.matches(&event.data) {
            return Ok(RuleDecision::Filter(FilterReason::Targeting));
        }

        if let Some(user_id) = &event.user_id {
            let site_id = event.site_id.as_deref().unwrap_or(&event.organization_id);

            match self
                .frequency
                .check_and_record(
                    site_id,
                    user_id,
                    self.policies.frequency_limit,
                    self.policies.frequency_window,
                )
                .await
            {
                Ok(true) => {}
                Ok(false) => return Ok(RuleDecision::Filter(FilterReason::FrequencyCapped)),
                Err(e) => {
                    tracing::warn!(error = %e, "Frequency check failed; allowing delivery");
                }
            }

            match self.store.user_preferences(site_id, user_id).await {
                Ok(Some(preferences)) => {
                    if !preferences.enabled {
                        return Ok(RuleDecision::Filter(FilterReason::UserPreferences));
                    }
                    let all_muted = template
                        .channels
                        .iter()
                        .all(|channel| preferences.muted_channels.contains(channel));
                    if !template.channels.is_empty() && all_muted {
                        return Ok(RuleDecision::Filter(FilterReason::UserPreferences));
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Preference lookup failed; allowing delivery");
                }
            }
        }

        let site_id = event.site_id.as_deref().unwrap_or(&event.organization_id);
        match self.store.business_hours(site_id).await {
            Ok(Some(hours)) => {
                if !within_business_hours(&hours, Utc::now()) {
                    return Ok(RuleDecision::Filter(FilterReason::BusinessHours));
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Business-hours lookup failed; allowing delivery");
            }
        }

        Ok(RuleDecision::Allow)
    }
}

/// Whether `now` falls inside the site's delivery window.
///
/// Overnight windows (`close < open`) wrap midnight.
#[must_use]
pub fn within_business_hours(hours: &BusinessHours, now: DateTime<Utc>) -> bool {
    let local = now + ChronoDuration::minutes(i64::from(hours.utc_offset_minutes));
    #[allow(clippy::cast_possible_truncation)] // Weekday index is 0-6.
    let weekday = chrono::Datelike::weekday(&local).num_days_from_monday() as u8;
    if !hours.days.contains(&weekday) {
        return false;
    }

    #[allow(clippy::cast_possible_truncation)] // Hour is 0-23.
    let hour = local.hour() as u8;
    if hours.open_hour <= hours.close_hour {
        hour >= hours.open_hour && hour < hours.close_hour
    } else {
        hour >= hours.open_hour || hour < hours.close_hour
    }
}
