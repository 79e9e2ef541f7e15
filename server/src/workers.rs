//! Queue delivery workers.
//!
//! Workers pull rendered notifications off their channel's priority queue
//! and publish them onto the site fan-out channel
//! (`notifications:<siteId>`), where the broker picks them up. Publish
//! failures requeue with exponential backoff until the retry budget moves
//! the item to the DLQ. An hourly-aged expiry sweep runs alongside.

use proofpulse_pubsub::PubSub;
use proofpulse_queue::{PriorityQueue, QueueBackend, QueueError, QueueItem};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Base delay for requeue backoff; doubles per retry.
const RETRY_BASE: Duration = Duration::from_secs(2);
/// How often the expiry sweep runs.
const EXPIRY_SWEEP_EVERY: u32 = 30;

/// A delivery worker bound to one channel.
pub struct DeliveryWorker<B: QueueBackend, P: PubSub> {
    queue: PriorityQueue<B>,
    pubsub: Arc<P>,
    channel: String,
    batch: usize,
    poll_interval: Duration,
}

impl<B: QueueBackend, P: PubSub> DeliveryWorker<B, P> {
    /// Create a worker for a channel.
    #[must_use]
    pub fn new(backend: Arc<B>, pubsub: Arc<P>, channel: impl Into<String>) -> Self {
        Self {
            queue: PriorityQueue::new(backend),
            pubsub,
            channel: channel.into(),
            batch: 32,
            poll_interval: Duration::from_millis(500),
        }
    }

    /// Run until shutdown. Pull-based: throughput is bounded by worker
    /// count, which is the pipeline's backpressure valve.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(channel = %self.channel, "Delivery worker started");
        let mut ticks: u32 = 0;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {
                    match self.tick().await {
                        Ok(0) => {}
                        Ok(delivered) => {
                            tracing::debug!(channel = %self.channel, delivered = delivered, "Delivery tick");
                        }
                        Err(e) => {
                            tracing::warn!(channel = %self.channel, error = %e, "Delivery tick failed");
                        }
                    }
                    ticks = ticks.wrapping_add(1);
                    if ticks % EXPIRY_SWEEP_EVERY == 0 {
                        if let Err(e) = self.queue.process_expired(&self.channel).await {
                            tracing::warn!(channel = %self.channel, error = %e, "Expiry sweep failed");
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!(channel = %self.channel, "Delivery worker stopped");
    }

    /// One dequeue-and-publish pass. Returns how many items were
    /// delivered to the fan-out bus.
    pub async fn tick(&self) -> Result<usize, QueueError> {
        let items = self.queue.dequeue(&self.channel, self.batch).await?;
        let mut delivered = 0;

        for item in items {
            let site_channel = format!("notifications:{}", item.site_id);
            match self.pubsub.publish(&site_channel, &item.payload).await {
                Ok(receivers) => {
                    delivered += 1;
                    metrics::counter!("worker.notifications_delivered", "channel" => self.channel.clone())
                        .increment(1);
                    tracing::debug!(
                        notification_id = %item.notification_id,
                        site_channel = %site_channel,
                        receivers = receivers,
                        "Notification fanned out"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        notification_id = %item.notification_id,
                        error = %e,
                        retry_count = item.retry_count,
                        "Fan-out failed; requeueing"
                    );
                    self.requeue_with_backoff(item).await?;
                }
            }
        }
        Ok(delivered)
    }

    async fn requeue_with_backoff(&self, item: QueueItem) -> Result<(), QueueError> {
        let delay = RETRY_BASE * 2_u32.saturating_pow(item.retry_count.min(10));
        if self.queue.requeue(item, delay).await?.is_none() {
            metrics::counter!("worker.notifications_dead_lettered", "channel" => self.channel.clone())
                .increment(1);
        }
        Ok(())
    }
}
