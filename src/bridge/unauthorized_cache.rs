//! Unauthorized access flood protection
//!
//! Senders outside the allow-list get an "Access denied" notice at most once
//! per cooldown period, so a chatty room cannot make the bridge spam it.

use crate::matrix::UserId;
use moka::future::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Cache of senders that recently received an "Access denied" notice
#[derive(Clone)]
pub struct UnauthorizedCache {
    /// Senders in cooldown, expiring after the cooldown period
    cache: Cache<UserId, ()>,
    /// Counter for silenced attempts (for logging throttling)
    silenced_count: Arc<AtomicU64>,
}

impl UnauthorizedCache {
    /// Creates a new `UnauthorizedCache`
    ///
    /// # Arguments
    ///
    /// * `cooldown_secs` - Seconds between notices to the same sender
    /// * `max_capacity` - Maximum number of senders tracked
    ///
    /// # Examples
    ///
    /// ```
    /// use matrix_agent_bridge::bridge::UnauthorizedCache;
    ///
    /// let cache = UnauthorizedCache::new(
    ///     1200,   // 20 minutes cooldown
    ///     10_000  // max 10k entries
    /// );
    /// ```
    #[must_use]
    pub fn new(cooldown_secs: u64, max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(Duration::from_secs(cooldown_secs))
            .build();

        Self {
            cache,
            silenced_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Checks if an "Access denied" notice should be sent to `sender`
    ///
    /// Returns `false` while the sender is in cooldown. Only every 100th
    /// silenced attempt is logged.
    pub async fn should_send(&self, sender: &UserId) -> bool {
        if self.cache.get(sender).await.is_none() {
            return true;
        }

        let count = self.silenced_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count % 100 == 0 {
            debug!(
                "Silenced {} unauthorized attempts (recent: {})",
                count, sender
            );
        }

        false
    }

    /// Starts the cooldown period for `sender`
    pub async fn mark_sent(&self, sender: UserId) {
        self.cache.insert(sender, ()).await;
    }

    /// Returns the total number of silenced unauthorized attempts
    #[must_use]
    pub fn silenced_count(&self) -> u64 {
        self.silenced_count.load(Ordering::Relaxed)
    }
}
