//! Rolling-window frequency caps.
//!
//! The materializer asks before every notification whether a (site, user)
//! pair is over its cap. The window is sliding: timestamps go into a scored
//! set, entries older than the window are trimmed on access, and the
//! remaining count is compared against the limit. No background sweeper is
//! needed.

use crate::backend::QueueBackend;
use crate::error::QueueError;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// Default cap: 10 notifications per user per hour.
pub const DEFAULT_LIMIT: u32 = 10;
/// Default rolling window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Sliding-window counter over the queue backend.
pub struct FrequencyLimiter<B: QueueBackend> {
    backend: Arc<B>,
}

impl<B: QueueBackend> Clone for FrequencyLimiter<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: QueueBackend> FrequencyLimiter<B> {
    /// Create a limiter over the given backend.
    #[must_use]
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    fn key(site_id: &str, user_id: &str) -> String {
        format!("freq:{site_id}:{user_id}")
    }

    /// Check the cap and record this delivery in one call.
    ///
    /// Returns `true` when the delivery is allowed (and recorded), `false`
    /// when the pair is over the cap.
    ///
    /// # Errors
    ///
    /// Returns backend errors; callers typically fail open on them.
    pub async fn check_and_record(
        &self,
        site_id: &str,
        user_id: &str,
        limit: u32,
        window: Duration,
    ) -> Result<bool, QueueError> {
        let key = Self::key(site_id, user_id);
        let now_ms = Utc::now().timestamp_millis();
        #[allow(clippy::cast_possible_wrap)]
        let window_start = now_ms - window.as_millis() as i64;

        // Trim entries that slid out of the window, then count what's left.
        #[allow(clippy::cast_precision_loss)]
        let in_window = {
            let stale = self
                .backend
                .fetch_below(&key, window_start as f64, usize::MAX >> 1)
                .await?;
            for member in stale {
                self.backend.remove(&key, &member).await?;
            }
            self.backend.len(&key).await?
        };

        if in_window >= u64::from(limit) {
            metrics::counter!("materializer.frequency_capped").increment(1);
            return Ok(false);
        }

        #[allow(clippy::cast_precision_loss)]
        self.backend
            .insert(&key, &now_ms.to_string(), now_ms as f64, window + DEFAULT_WINDOW)
            .await?;
        Ok(true)
    }
}
