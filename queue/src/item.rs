//! Queue item model and the priority score function.
//!
//! Each channel is a scored multiset: lower score dequeues first. The score
//! folds together the scheduled time and the priority weight so one range
//! query drives both "is it due" and "who goes first".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery priority of a queued notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Jump the line.
    Urgent,
    /// Ahead of the default.
    High,
    /// The default.
    Normal,
    /// Behind everything else.
    Low,
}

impl Priority {
    /// Score divisor; larger weight sorts earlier at equal scheduled times.
    #[must_use]
    pub const fn weight(self) -> u32 {
        match self {
            Self::Urgent => 4,
            Self::High => 3,
            Self::Normal => 2,
            Self::Low => 1,
        }
    }
}

/// Extra head start for urgent items, in milliseconds of score space.
const URGENT_BOOST_MS: f64 = 1_000_000.0;

/// Compute the sort score for a priority at a scheduled time.
///
/// Lower score dequeues first. The scheduled time in epoch milliseconds is
/// divided by the priority weight, which yields `urgent < high < normal <
/// low` at equal scheduled times, and urgent items additionally get a fixed
/// head start so they sort ahead even across small scheduling skews. Future
/// scheduling always yields a larger score than scheduling now at the same
/// priority.
#[must_use]
pub fn score_for(priority: Priority, scheduled_for: DateTime<Utc>) -> f64 {
    #[allow(clippy::cast_precision_loss)] // Millisecond timestamps stay well inside f64's 2^53 integer range.
    let ms = scheduled_for.timestamp_millis() as f64;
    let scaled = ms / f64::from(priority.weight());
    if priority == Priority::Urgent {
        scaled - URGENT_BOOST_MS
    } else {
        scaled
    }
}

/// A notification waiting for delivery on a channel queue.
///
/// # Invariant
///
/// At most one live copy per `(channel, notification_id)`; the enqueue →
/// dequeue → requeue protocol maintains this (dequeue removes before any
/// requeue re-inserts).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// The materialized notification this item delivers.
    pub notification_id: String,
    /// Owning site.
    pub site_id: String,
    /// Delivery channel (e.g. `web`, `email`).
    pub channel: String,
    /// Delivery priority.
    pub priority: Priority,
    /// Rendered payload handed to the delivery worker.
    pub payload: serde_json::Value,
    /// When the item entered the queue.
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the item may be delivered.
    pub scheduled_for: DateTime<Utc>,
    /// Requeue count so far.
    pub retry_count: u32,
    /// Requeues allowed before dead-lettering.
    pub max_retries: u32,
    /// Sort score, recomputed on every (re)enqueue.
    pub score: f64,
}

impl QueueItem {
    /// Create an item scheduled for immediate delivery with defaults
    /// (`retry_count` 0, `max_retries` 3).
    #[must_use]
    pub fn new(
        notification_id: impl Into<String>,
        site_id: impl Into<String>,
        channel: impl Into<String>,
        priority: Priority,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            notification_id: notification_id.into(),
            site_id: site_id.into(),
            channel: channel.into(),
            priority,
            payload,
            enqueued_at: now,
            scheduled_for: now,
            retry_count: 0,
            max_retries: 3,
            score: score_for(priority, now),
        }
    }

    /// Schedule the item for a future time.
    #[must_use]
    pub fn scheduled_at(mut self, scheduled_for: DateTime<Utc>) -> Self {
        self.scheduled_for = scheduled_for;
        self.score = score_for(self.priority, scheduled_for);
        self
    }

    /// Override the retry budget.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Whether the item is due at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for <= now
    }
}

/// Why an item landed in the dead-letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqReason {
    /// Retry budget exhausted.
    MaxRetriesExceeded,
    /// Sat unprocessed past the expiry age.
    Expired,
    /// Stored bytes could not be decoded.
    Poison,
}

/// A dead-lettered item with its failure envelope.
///
/// `item` is the original queue-item JSON when it was decodable, or the raw
/// stored string for poison entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// Why the item was moved.
    pub reason: DlqReason,
    /// When the item was moved.
    pub moved_at: DateTime<Utc>,
    /// The item as stored.
    pub item: serde_json::Value,
}

/// Channel-level queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Items in the main queue.
    pub total: u64,
    /// Items whose score is at or below now (due by score-time).
    pub ready: u64,
    /// Items scheduled past now.
    pub scheduled: u64,
    /// Items in the dead-letter queue.
    pub dead_letter: u64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn priority_order_at_equal_times() {
        // A realistic epoch timestamp, not zero.
        let t = at(1_722_470_400_000);
        let urgent = score_for(Priority::Urgent, t);
        let high = score_for(Priority::High, t);
        let normal = score_for(Priority::Normal, t);
        let low = score_for(Priority::Low, t);

        assert!(urgent < high, "urgent before high");
        assert!(high < normal, "high before normal");
        assert!(normal < low, "normal before low");
    }

    #[test]
    fn later_scheduling_scores_higher_within_a_priority() {
        let now = at(1_722_470_400_000);
        let later = at(1_722_470_460_000);
        for priority in [Priority::Urgent, Priority::High, Priority::Normal, Priority::Low] {
            assert!(
                score_for(priority, now) < score_for(priority, later),
                "{priority:?} future schedule must score higher"
            );
        }
    }

    #[test]
    fn due_check_uses_scheduled_time() {
        let now = Utc::now();
        let item = QueueItem::new("n-1", "site-1", "web", Priority::Normal, serde_json::json!({}));
        assert!(item.is_due(now + chrono::Duration::seconds(1)));

        let future = item.clone().scheduled_at(now + chrono::Duration::minutes(5));
        assert!(!future.is_due(now));
    }

    #[test]
    fn item_json_uses_camel_case() {
        let item = QueueItem::new("n-1", "site-1", "web", Priority::Urgent, serde_json::json!({}));
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["notificationId"], "n-1");
        assert_eq!(value["priority"], "urgent");
        assert!(value["scheduledFor"].is_string());
    }

    #[test]
    fn dlq_reason_serializes_snake_case() {
        let reason = serde_json::to_value(DlqReason::MaxRetriesExceeded).unwrap();
        assert_eq!(reason, "max_retries_exceeded");
    }

    mod laws {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Any realistic scheduled time preserves the priority ladder.
            #[test]
            fn priority_ladder_holds_for_any_time(ms in 1_000_000_000_000_i64..4_000_000_000_000_i64) {
                let t = at(ms);
                let scores = [
                    score_for(Priority::Urgent, t),
                    score_for(Priority::High, t),
                    score_for(Priority::Normal, t),
                    score_for(Priority::Low, t),
                ];
                prop_assert!(scores.windows(2).all(|w| w[0] < w[1]));
            }

            #[test]
            fn score_is_monotonic_in_time(
                base in 1_000_000_000_000_i64..4_000_000_000_000_i64,
                delta in 1_i64..86_400_000_i64,
            ) {
                for priority in [Priority::Urgent, Priority::High, Priority::Normal, Priority::Low] {
                    prop_assert!(score_for(priority, at(base)) < score_for(priority, at(base + delta)));
                }
            }
        }
    }
}
