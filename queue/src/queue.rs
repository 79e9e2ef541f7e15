//! Per-channel priority queue with retry and dead-lettering.
//!
//! Each delivery channel gets two keys in the backend:
//!
//! - `queue:<channel>` - the live queue, a scored multiset of item JSON.
//! - `queue:dlq:<channel>` - dead letters, scored by the time they moved.
//!
//! Dequeue is an atomic per-item take: candidates are read by score, the
//! due ones are claimed with an atomic remove, and a racing worker simply
//! loses the claim. A crash after a successful take loses the item, which
//! is within the at-least-once contract - the upstream materializer will
//! produce again on redelivery.

use crate::backend::QueueBackend;
use crate::error::QueueError;
use crate::item::{score_for, DeadLetter, DlqReason, QueueItem, QueueStats};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Live queue keys expire after a day of inactivity.
const QUEUE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Dead letters are retained for a week.
const DLQ_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Items unprocessed for an hour are expired to the DLQ.
const EXPIRY_AGE_SECS: i64 = 60 * 60;
/// Upper bound for full-queue scans (remove-by-id, expiry sweeps).
const SCAN_LIMIT: usize = 10_000;

/// Priority queue over a scored-multiset backend.
pub struct PriorityQueue<B: QueueBackend> {
    backend: Arc<B>,
}

impl<B: QueueBackend> Clone for PriorityQueue<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: QueueBackend> PriorityQueue<B> {
    /// Create a queue over the given backend.
    #[must_use]
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    fn queue_key(channel: &str) -> String {
        format!("queue:{channel}")
    }

    fn dlq_key(channel: &str) -> String {
        format!("queue:dlq:{channel}")
    }

    /// Enqueue an item on its channel.
    ///
    /// Stamps `enqueued_at`, recomputes the score, and refreshes the 24h
    /// key TTL.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidItem`] when the id, site, or channel is
    /// empty, and backend errors otherwise.
    pub async fn enqueue(&self, mut item: QueueItem) -> Result<QueueItem, QueueError> {
        if item.notification_id.is_empty() {
            return Err(QueueError::InvalidItem("notification_id is empty".into()));
        }
        if item.site_id.is_empty() {
            return Err(QueueError::InvalidItem("site_id is empty".into()));
        }
        if item.channel.is_empty() {
            return Err(QueueError::InvalidItem("channel is empty".into()));
        }

        item.enqueued_at = Utc::now();
        item.score = score_for(item.priority, item.scheduled_for);

        let member = serde_json::to_string(&item)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.backend
            .insert(&Self::queue_key(&item.channel), &member, item.score, QUEUE_TTL)
            .await?;

        tracing::debug!(
            notification_id = %item.notification_id,
            channel = %item.channel,
            priority = ?item.priority,
            scheduled_for = %item.scheduled_for,
            "Enqueued item"
        );
        metrics::counter!("queue.enqueued", "channel" => item.channel.clone()).increment(1);

        Ok(item)
    }

    /// Take up to `limit` due items, highest priority first.
    ///
    /// Un-parseable members are moved to the DLQ with reason `poison` so
    /// they cannot wedge the channel.
    ///
    /// # Errors
    ///
    /// Returns backend errors; an empty queue is `Ok(vec![])`.
    pub async fn dequeue(&self, channel: &str, limit: usize) -> Result<Vec<QueueItem>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        #[allow(clippy::cast_precision_loss)]
        let bound = now.timestamp_millis() as f64;
        let key = Self::queue_key(channel);

        // Overfetch: the score bound also admits scaled not-yet-due items.
        let candidates = self
            .backend
            .fetch_below(&key, bound, limit.saturating_mul(4).max(16))
            .await?;

        let mut taken = Vec::with_capacity(limit);
        for member in candidates {
            if taken.len() == limit {
                break;
            }
            match serde_json::from_str::<QueueItem>(&member) {
                Ok(item) => {
                    if !item.is_due(now) {
                        continue;
                    }
                    // Atomic claim: only the worker whose remove succeeds
                    // keeps the item.
                    if self.backend.remove(&key, &member).await? {
                        taken.push(item);
                    }
                }
                Err(e) => {
                    tracing::warn!(channel = %channel, error = %e, "Dropping un-parseable queue member");
                    if self.backend.remove(&key, &member).await? {
                        self.dead_letter_raw(channel, &member, DlqReason::Poison).await?;
                    }
                }
            }
        }

        if !taken.is_empty() {
            metrics::counter!("queue.dequeued", "channel" => channel.to_string())
                .increment(taken.len() as u64);
        }
        Ok(taken)
    }

    /// Read up to `limit` items in score order without removing them.
    ///
    /// # Errors
    ///
    /// Returns backend errors.
    pub async fn peek(&self, channel: &str, limit: usize) -> Result<Vec<QueueItem>, QueueError> {
        let members = self
            .backend
            .fetch_range(&Self::queue_key(channel), limit)
            .await?;
        Ok(members
            .into_iter()
            .filter_map(|(member, _)| serde_json::from_str(&member).ok())
            .collect())
    }

    /// Requeue a previously dequeued item after `delay`.
    ///
    /// Increments the retry count; when the budget is exhausted the item is
    /// dead-lettered with reason `max_retries_exceeded` and `None` comes
    /// back.
    ///
    /// # Errors
    ///
    /// Returns backend errors from the re-insert or the DLQ move.
    pub async fn requeue(
        &self,
        mut item: QueueItem,
        delay: Duration,
    ) -> Result<Option<QueueItem>, QueueError> {
        item.retry_count += 1;

        if item.retry_count > item.max_retries {
            tracing::warn!(
                notification_id = %item.notification_id,
                channel = %item.channel,
                retry_count = item.retry_count,
                max_retries = item.max_retries,
                "Retry budget exhausted, dead-lettering"
            );
            self.move_to_dead_letter(item, DlqReason::MaxRetriesExceeded).await?;
            return Ok(None);
        }

        let delay = ChronoDuration::from_std(delay)
            .map_err(|e| QueueError::InvalidItem(format!("delay out of range: {e}")))?;
        item.scheduled_for = Utc::now() + delay;
        let item = self.enqueue(item).await?;
        metrics::counter!("queue.requeued", "channel" => item.channel.clone()).increment(1);
        Ok(Some(item))
    }

    /// Remove an item by notification id. Returns whether one was removed.
    ///
    /// # Errors
    ///
    /// Returns backend errors from the scan or the remove.
    pub async fn remove(&self, channel: &str, notification_id: &str) -> Result<bool, QueueError> {
        let key = Self::queue_key(channel);
        let members = self.backend.fetch_range(&key, SCAN_LIMIT).await?;

        for (member, _) in members {
            let matches = serde_json::from_str::<QueueItem>(&member)
                .map(|item| item.notification_id == notification_id)
                .unwrap_or(false);
            if matches && self.backend.remove(&key, &member).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Wipe a channel's live queue.
    ///
    /// # Errors
    ///
    /// Returns backend errors.
    pub async fn clear(&self, channel: &str) -> Result<(), QueueError> {
        self.backend.clear(&Self::queue_key(channel)).await
    }

    /// Move items that have sat unprocessed past the expiry age to the DLQ
    /// with reason `expired`. Returns how many moved.
    ///
    /// # Errors
    ///
    /// Returns backend errors from the scan or the moves.
    pub async fn process_expired(&self, channel: &str) -> Result<u64, QueueError> {
        let key = Self::queue_key(channel);
        let cutoff = Utc::now() - ChronoDuration::seconds(EXPIRY_AGE_SECS);
        let members = self.backend.fetch_range(&key, SCAN_LIMIT).await?;

        let mut moved = 0;
        for (member, _) in members {
            let expired = serde_json::from_str::<QueueItem>(&member)
                .map(|item| item.enqueued_at < cutoff)
                .unwrap_or(true);
            if expired && self.backend.remove(&key, &member).await? {
                self.dead_letter_raw(channel, &member, DlqReason::Expired).await?;
                moved += 1;
            }
        }

        if moved > 0 {
            tracing::info!(channel = %channel, moved = moved, "Expired items moved to DLQ");
            metrics::counter!("queue.expired", "channel" => channel.to_string()).increment(moved);
        }
        Ok(moved)
    }

    /// Move an item into the channel's dead-letter queue.
    ///
    /// # Errors
    ///
    /// Returns backend errors from the insert.
    pub async fn move_to_dead_letter(
        &self,
        item: QueueItem,
        reason: DlqReason,
    ) -> Result<(), QueueError> {
        let channel = item.channel.clone();
        let value = serde_json::to_value(&item)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.push_dead_letter(&channel, value, reason).await
    }

    /// Read up to `limit` dead letters, oldest first.
    ///
    /// # Errors
    ///
    /// Returns backend errors.
    pub async fn dead_letters(
        &self,
        channel: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetter>, QueueError> {
        let members = self
            .backend
            .fetch_range(&Self::dlq_key(channel), limit)
            .await?;
        Ok(members
            .into_iter()
            .filter_map(|(member, _)| serde_json::from_str(&member).ok())
            .collect())
    }

    /// Channel counters: total, due-by-score, scheduled, dead-lettered.
    ///
    /// # Errors
    ///
    /// Returns backend errors.
    pub async fn stats(&self, channel: &str) -> Result<QueueStats, QueueError> {
        let key = Self::queue_key(channel);
        #[allow(clippy::cast_precision_loss)]
        let bound = Utc::now().timestamp_millis() as f64;

        let total = self.backend.len(&key).await?;
        let ready = self.backend.count_below(&key, bound).await?;
        let dead_letter = self.backend.len(&Self::dlq_key(channel)).await?;

        Ok(QueueStats {
            total,
            ready,
            scheduled: total.saturating_sub(ready),
            dead_letter,
        })
    }

    async fn dead_letter_raw(
        &self,
        channel: &str,
        member: &str,
        reason: DlqReason,
    ) -> Result<(), QueueError> {
        let value = serde_json::from_str(member)
            .unwrap_or_else(|_| serde_json::Value::String(member.to_string()));
        self.push_dead_letter(channel, value, reason).await
    }

    async fn push_dead_letter(
        &self,
        channel: &str,
        item: serde_json::Value,
        reason: DlqReason,
    ) -> Result<(), QueueError> {
        let moved_at = Utc::now();
        let letter = DeadLetter {
            reason,
            moved_at,
            item,
        };
        let member = serde_json::to_string(&letter)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        #[allow(clippy::cast_precision_loss)]
        let score = moved_at.timestamp_millis() as f64;

        self.backend
            .insert(&Self::dlq_key(channel), &member, score, DLQ_TTL)
            .await?;
        metrics::counter!(
            "queue.dead_lettered",
            "channel" => channel.to_string(),
            "reason" => format!("{reason:?}")
        )
        .increment(1);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::item::Priority;
    use serde_json::json;

    fn queue() -> PriorityQueue<InMemoryBackend> {
        PriorityQueue::new(Arc::new(InMemoryBackend::new()))
    }

    fn item(id: &str, priority: Priority) -> QueueItem {
        QueueItem::new(id, "site-1", "web", priority, json!({ "n": id }))
    }

    #[tokio::test]
    async fn enqueue_rejects_blank_fields() {
        let queue = queue();
        let blank = QueueItem::new("", "site-1", "web", Priority::Normal, json!({}));
        assert!(matches!(
            queue.enqueue(blank).await,
            Err(QueueError::InvalidItem(_))
        ));
    }

    #[tokio::test]
    async fn dequeue_respects_priority_order() {
        let queue = queue();
        // Enqueue in the "wrong" order on purpose.
        queue.enqueue(item("low-a", Priority::Low)).await.unwrap();
        queue.enqueue(item("urgent-b", Priority::Urgent)).await.unwrap();
        queue.enqueue(item("normal-c", Priority::Normal)).await.unwrap();

        let taken = queue.dequeue("web", 3).await.unwrap();
        let ids: Vec<_> = taken.iter().map(|i| i.notification_id.as_str()).collect();
        assert_eq!(ids, vec!["urgent-b", "normal-c", "low-a"]);
    }

    #[tokio::test]
    async fn dequeue_on_empty_queue_is_empty_and_harmless() {
        let queue = queue();
        assert!(queue.dequeue("web", 10).await.unwrap().is_empty());
        let stats = queue.stats("web").await.unwrap();
        assert_eq!(stats.total, 0);
    }

    #[tokio::test]
    async fn future_items_are_not_dequeued() {
        let queue = queue();
        let future = item("later", Priority::Urgent)
            .scheduled_at(Utc::now() + ChronoDuration::minutes(10));
        queue.enqueue(future).await.unwrap();

        assert!(queue.dequeue("web", 10).await.unwrap().is_empty());
        assert_eq!(queue.stats("web").await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn dequeued_items_leave_the_queue() {
        let queue = queue();
        queue.enqueue(item("one", Priority::Normal)).await.unwrap();

        assert_eq!(queue.dequeue("web", 1).await.unwrap().len(), 1);
        assert!(queue.dequeue("web", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn requeue_increments_and_delays() {
        let queue = queue();
        let original = queue.enqueue(item("retry-me", Priority::Normal)).await.unwrap();
        let taken = queue.dequeue("web", 1).await.unwrap().remove(0);
        assert_eq!(taken.notification_id, original.notification_id);

        let requeued = queue
            .requeue(taken, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(requeued.retry_count, 1);
        assert!(requeued.scheduled_for > Utc::now());
        // Delayed, so not immediately due.
        assert!(queue.dequeue("web", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_land_in_dlq_and_leave_main_queue() {
        let queue = queue();
        let mut exhausted = item("doomed", Priority::High).with_max_retries(2);
        exhausted.retry_count = 2;

        let outcome = queue.requeue(exhausted, Duration::from_secs(1)).await.unwrap();
        assert!(outcome.is_none());

        let stats = queue.stats("web").await.unwrap();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.dead_letter, 1);

        let letters = queue.dead_letters("web", 10).await.unwrap();
        assert_eq!(letters[0].reason, DlqReason::MaxRetriesExceeded);
        assert_eq!(letters[0].item["notificationId"], "doomed");
    }

    #[tokio::test]
    async fn expired_items_move_to_dlq() {
        let queue = queue();
        // An item that entered the queue two hours ago.
        let mut stale = item("stale", Priority::Low);
        stale.enqueued_at = Utc::now() - ChronoDuration::hours(2);
        stale.scheduled_for = stale.enqueued_at;
        stale.score = score_for(stale.priority, stale.scheduled_for);
        let member = serde_json::to_string(&stale).unwrap();
        queue
            .backend
            .insert("queue:web", &member, stale.score, Duration::from_secs(60))
            .await
            .unwrap();
        // A fresh item that must survive the sweep.
        queue.enqueue(item("fresh", Priority::Low)).await.unwrap();

        let moved = queue.process_expired("web").await.unwrap();
        assert_eq!(moved, 1);
        let letters = queue.dead_letters("web", 10).await.unwrap();
        assert_eq!(letters[0].reason, DlqReason::Expired);
        let remaining = queue.peek("web", 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].notification_id, "fresh");
    }

    #[tokio::test]
    async fn remove_by_id_targets_one_item() {
        let queue = queue();
        queue.enqueue(item("keep", Priority::Normal)).await.unwrap();
        queue.enqueue(item("drop", Priority::Normal)).await.unwrap();

        assert!(queue.remove("web", "drop").await.unwrap());
        assert!(!queue.remove("web", "drop").await.unwrap());

        let remaining = queue.peek("web", 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].notification_id, "keep");
    }

    #[tokio::test]
    async fn poison_members_are_dead_lettered_on_dequeue() {
        let queue = queue();
        queue
            .backend
            .insert("queue:web", "{ not json", 0.0, Duration::from_secs(60))
            .await
            .unwrap();

        assert!(queue.dequeue("web", 5).await.unwrap().is_empty());
        let letters = queue.dead_letters("web", 10).await.unwrap();
        assert_eq!(letters[0].reason, DlqReason::Poison);
        assert_eq!(queue.stats("web").await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn clear_wipes_the_channel() {
        let queue = queue();
        queue.enqueue(item("a", Priority::Normal)).await.unwrap();
        queue.enqueue(item("b", Priority::Normal)).await.unwrap();

        queue.clear("web").await.unwrap();
        assert_eq!(queue.stats("web").await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let queue = queue();
        queue.enqueue(item("web-item", Priority::Normal)).await.unwrap();
        let mut email = item("email-item", Priority::Normal);
        email.channel = "email".to_string();
        queue.enqueue(email).await.unwrap();

        assert_eq!(queue.dequeue("web", 10).await.unwrap().len(), 1);
        assert_eq!(queue.dequeue("email", 10).await.unwrap().len(), 1);
    }
}
