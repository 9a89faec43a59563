use crate::config::{AuthConfig, StorageType};
use crate::credential::{Credential, Purpose};
use crate::errors::AuthError;
use crate::session::SessionState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub mod memory;

/// Keyed state shared by the engine, the session flow and the limiter.
///
/// Every method touches a single key and must be atomic against it. Nothing
/// here spans more than one key, so implementations never need cross-key locks.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Storage: Send + Sync {
    /// Replaces whatever credential is stored for the same principal and purpose.
    async fn put_credential(&self, credential: &Credential, ttl_seconds: u64)
        -> Result<(), AuthError>;
    /// Returns the stored credential even if its validity window has passed.
    async fn get_credential(
        &self,
        principal_id: &str,
        purpose: Purpose,
    ) -> Result<Option<Credential>, AuthError>;
    async fn delete_credential(&self, principal_id: &str, purpose: Purpose)
        -> Result<(), AuthError>;
    /// Deletes the stored credential only while it still carries `token`.
    /// Returns true for the one caller that removed it.
    async fn consume_credential(
        &self,
        principal_id: &str,
        purpose: Purpose,
        token: &str,
    ) -> Result<bool, AuthError>;

    async fn increment_counter(&self, key: &str, ttl_seconds: u64) -> Result<u32, AuthError>;
    async fn get_counter(&self, key: &str) -> Result<u32, AuthError>;
    async fn delete_counter(&self, key: &str) -> Result<(), AuthError>;

    /// Appends `at` to the key's event log after dropping events at or before
    /// `since`. Returns the number of events left, including the new one.
    async fn record_event(
        &self,
        key: &str,
        at: DateTime<Utc>,
        since: DateTime<Utc>,
        ttl_seconds: u64,
    ) -> Result<u32, AuthError>;
    /// Events newer than `since`, oldest first.
    async fn list_events(
        &self,
        key: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, AuthError>;
    async fn delete_events(&self, key: &str) -> Result<(), AuthError>;

    /// Markers hold a deadline (cooldowns, lockouts). `ttl_seconds` is only the
    /// retention horizon; callers compare the deadline against their clock.
    async fn set_marker(
        &self,
        key: &str,
        until: DateTime<Utc>,
        ttl_seconds: u64,
    ) -> Result<(), AuthError>;
    /// Returns false without writing when a live marker already exists.
    async fn set_marker_if_absent(
        &self,
        key: &str,
        until: DateTime<Utc>,
        ttl_seconds: u64,
    ) -> Result<bool, AuthError>;
    async fn get_marker(&self, key: &str) -> Result<Option<DateTime<Utc>>, AuthError>;
    async fn delete_marker(&self, key: &str) -> Result<(), AuthError>;

    async fn load_session(&self, session_id: &str) -> Result<Option<SessionState>, AuthError>;
    async fn save_session(
        &self,
        session_id: &str,
        state: &SessionState,
        ttl_seconds: u64,
    ) -> Result<(), AuthError>;
    async fn delete_session(&self, session_id: &str) -> Result<(), AuthError>;

    /// Drops entries past their validity. Returns how many were removed.
    async fn purge_expired(&self) -> Result<usize, AuthError>;
}

pub mod redis;
pub use self::memory::InMemoryStorage;
pub use self::redis::RedisStorage;

/// Builds the backend selected by `config.storage_type`.
pub fn from_config(config: &AuthConfig) -> Result<Arc<dyn Storage>, AuthError> {
    Ok(match config.storage_type {
        StorageType::Memory => Arc::new(InMemoryStorage::new()),
        StorageType::Redis => Arc::new(RedisStorage::new(&config.redis_url)?),
    })
}
