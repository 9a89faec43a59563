//! Per-subject counting over time.
//!
//! [`WindowCounter`] counts within fixed wall-clock windows: a subject's count
//! for window `w` lives under `{namespace}:{subject}:{w}` where
//! `w = floor(unix_now / length)`. Entries are retained for one extra window
//! and then evicted by TTL or by [`WindowCounter::evict_stale`].
//!
//! [`SlidingLog`] keeps one timestamp per event, so a quota over the last
//! `length` seconds is exact at any instant, including across window
//! boundaries.

use crate::clock::Clock;
use crate::errors::AuthError;
use crate::storage::Storage;
use chrono::Duration;
use std::sync::Arc;

#[derive(Clone)]
pub struct WindowCounter {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    namespace: &'static str,
    length_secs: u64,
}

impl WindowCounter {
    pub fn new(
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        namespace: &'static str,
        length_secs: u64,
    ) -> Self {
        Self {
            storage,
            clock,
            namespace,
            length_secs: length_secs.max(1),
        }
    }

    fn now_secs(&self) -> u64 {
        u64::try_from(self.clock.now().timestamp()).unwrap_or(0)
    }

    pub fn current_index(&self) -> u64 {
        self.now_secs() / self.length_secs
    }

    /// Seconds until the current window rolls over.
    pub fn secs_until_reset(&self) -> u64 {
        self.length_secs - self.now_secs() % self.length_secs
    }

    fn entry_key(&self, subject: &str, index: u64) -> String {
        format!("{}:{}:{}", self.namespace, subject, index)
    }

    pub async fn increment(&self, subject: &str) -> Result<u32, AuthError> {
        let key = self.entry_key(subject, self.current_index());
        self.storage
            .increment_counter(&key, self.length_secs * 2)
            .await
    }

    pub async fn count(&self, subject: &str) -> Result<u32, AuthError> {
        let key = self.entry_key(subject, self.current_index());
        self.storage.get_counter(&key).await
    }

    pub async fn clear(&self, subject: &str) -> Result<(), AuthError> {
        let index = self.current_index();
        self.storage
            .delete_counter(&self.entry_key(subject, index))
            .await?;
        if index > 0 {
            self.storage
                .delete_counter(&self.entry_key(subject, index - 1))
                .await?;
        }
        Ok(())
    }

    /// Removes the newest entry that is no longer current or previous. Older
    /// ones have already passed their TTL.
    pub async fn evict_stale(&self, subject: &str) -> Result<(), AuthError> {
        let index = self.current_index();
        if index >= 2 {
            self.storage
                .delete_counter(&self.entry_key(subject, index - 2))
                .await?;
        }
        Ok(())
    }
}

/// Timestamped events over a trailing window of `length_secs`.
#[derive(Clone)]
pub struct SlidingLog {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    namespace: &'static str,
    length: Duration,
    length_secs: u64,
}

impl SlidingLog {
    pub fn new(
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        namespace: &'static str,
        length_secs: u64,
    ) -> Self {
        let length_secs = length_secs.max(1);
        Self {
            storage,
            clock,
            namespace,
            length: Duration::seconds(i64::try_from(length_secs).unwrap_or(i64::MAX / 1000)),
            length_secs,
        }
    }

    fn key(&self, subject: &str) -> String {
        format!("{}:{}", self.namespace, subject)
    }

    /// Records an event now. Returns the events inside the window, this one
    /// included.
    pub async fn record(&self, subject: &str) -> Result<u32, AuthError> {
        let now = self.clock.now();
        self.storage
            .record_event(&self.key(subject), now, now - self.length, self.length_secs)
            .await
    }

    pub async fn count(&self, subject: &str) -> Result<u32, AuthError> {
        let now = self.clock.now();
        let events = self
            .storage
            .list_events(&self.key(subject), now - self.length)
            .await?;
        Ok(u32::try_from(events.len()).unwrap_or(u32::MAX))
    }

    /// `Some(seconds)` until the subject drops below `limit` events, or `None`
    /// when it already is below.
    pub async fn retry_after(&self, subject: &str, limit: u32) -> Result<Option<u64>, AuthError> {
        let now = self.clock.now();
        let events = self
            .storage
            .list_events(&self.key(subject), now - self.length)
            .await?;
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        if events.len() < limit {
            return Ok(None);
        }

        // the slot frees up when the event `limit` places from the newest ages out
        let Some(freeing) = events
            .len()
            .checked_sub(limit.max(1))
            .and_then(|index| events.get(index))
        else {
            return Ok(Some(self.length_secs));
        };
        let secs = (*freeing + self.length - now).num_seconds();
        Ok(Some(u64::try_from(secs).unwrap_or(0).max(1)))
    }

    pub async fn clear(&self, subject: &str) -> Result<(), AuthError> {
        self.storage.delete_events(&self.key(subject)).await
    }
}
