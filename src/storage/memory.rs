use crate::clock::{Clock, SystemClock};
use crate::credential::{Credential, Purpose};
use crate::errors::AuthError;
use crate::session::SessionState;
use crate::storage::Storage;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Clone)]
struct CredentialEntry {
    credential: Credential,
    expiry: DateTime<Utc>,
}

#[derive(Clone)]
struct CounterEntry {
    count: u32,
    expiry: DateTime<Utc>,
}

#[derive(Clone)]
struct EventLogEntry {
    events: Vec<DateTime<Utc>>,
    expiry: DateTime<Utc>,
}

#[derive(Clone)]
struct MarkerEntry {
    until: DateTime<Utc>,
    expiry: DateTime<Utc>,
}

#[derive(Clone)]
struct SessionEntry {
    state: SessionState,
    expiry: DateTime<Utc>,
}

/// Process-local storage. Each map is sharded, so an update holds the lock of
/// one shard for the duration of a single key's read-modify-write.
pub struct InMemoryStorage {
    clock: Arc<dyn Clock>,
    credentials: DashMap<(String, Purpose), CredentialEntry>,
    counters: DashMap<String, CounterEntry>,
    events: DashMap<String, EventLogEntry>,
    markers: DashMap<String, MarkerEntry>,
    sessions: DashMap<String, SessionEntry>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            credentials: DashMap::new(),
            counters: DashMap::new(),
            events: DashMap::new(),
            markers: DashMap::new(),
            sessions: DashMap::new(),
        }
    }

    fn expiry(&self, ttl_seconds: u64) -> DateTime<Utc> {
        let ttl = i64::try_from(ttl_seconds).unwrap_or(i64::MAX / 1000);
        self.clock.now() + Duration::seconds(ttl)
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn put_credential(
        &self,
        credential: &Credential,
        ttl_seconds: u64,
    ) -> Result<(), AuthError> {
        self.credentials.insert(
            (credential.principal_id.clone(), credential.purpose),
            CredentialEntry {
                credential: credential.clone(),
                expiry: self.expiry(ttl_seconds),
            },
        );
        Ok(())
    }

    async fn get_credential(
        &self,
        principal_id: &str,
        purpose: Purpose,
    ) -> Result<Option<Credential>, AuthError> {
        let now = self.clock.now();
        Ok(self
            .credentials
            .get(&(principal_id.to_string(), purpose))
            .filter(|entry| entry.expiry > now)
            .map(|entry| entry.credential.clone()))
    }

    async fn delete_credential(
        &self,
        principal_id: &str,
        purpose: Purpose,
    ) -> Result<(), AuthError> {
        self.credentials.remove(&(principal_id.to_string(), purpose));
        Ok(())
    }

    async fn consume_credential(
        &self,
        principal_id: &str,
        purpose: Purpose,
        token: &str,
    ) -> Result<bool, AuthError> {
        let now = self.clock.now();
        Ok(self
            .credentials
            .remove_if(&(principal_id.to_string(), purpose), |_, entry| {
                entry.expiry > now && entry.credential.token == token
            })
            .is_some())
    }

    async fn increment_counter(&self, key: &str, ttl_seconds: u64) -> Result<u32, AuthError> {
        let now = self.clock.now();
        let expiry = self.expiry(ttl_seconds);

        let count = match self.counters.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if now >= entry.expiry {
                    entry.count = 1;
                    entry.expiry = expiry;
                } else {
                    entry.count = entry.count.saturating_add(1);
                }
                entry.count
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CounterEntry { count: 1, expiry });
                1
            }
        };

        Ok(count)
    }

    async fn get_counter(&self, key: &str) -> Result<u32, AuthError> {
        let now = self.clock.now();
        Ok(self
            .counters
            .get(key)
            .filter(|entry| entry.expiry > now)
            .map_or(0, |entry| entry.count))
    }

    async fn delete_counter(&self, key: &str) -> Result<(), AuthError> {
        self.counters.remove(key);
        Ok(())
    }

    async fn record_event(
        &self,
        key: &str,
        at: DateTime<Utc>,
        since: DateTime<Utc>,
        ttl_seconds: u64,
    ) -> Result<u32, AuthError> {
        let now = self.clock.now();
        let expiry = self.expiry(ttl_seconds);

        let mut log = self.events.entry(key.to_string()).or_insert(EventLogEntry {
            events: Vec::new(),
            expiry,
        });
        if now >= log.expiry {
            log.events.clear();
        }
        log.events.retain(|event| *event > since);
        log.events.push(at);
        log.expiry = expiry;

        Ok(u32::try_from(log.events.len()).unwrap_or(u32::MAX))
    }

    async fn list_events(
        &self,
        key: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, AuthError> {
        let now = self.clock.now();
        Ok(self
            .events
            .get(key)
            .filter(|log| log.expiry > now)
            .map(|log| {
                log.events
                    .iter()
                    .copied()
                    .filter(|event| *event > since)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_events(&self, key: &str) -> Result<(), AuthError> {
        self.events.remove(key);
        Ok(())
    }

    async fn set_marker(
        &self,
        key: &str,
        until: DateTime<Utc>,
        ttl_seconds: u64,
    ) -> Result<(), AuthError> {
        self.markers.insert(
            key.to_string(),
            MarkerEntry {
                until,
                expiry: self.expiry(ttl_seconds),
            },
        );
        Ok(())
    }

    async fn set_marker_if_absent(
        &self,
        key: &str,
        until: DateTime<Utc>,
        ttl_seconds: u64,
    ) -> Result<bool, AuthError> {
        let now = self.clock.now();
        let marker = MarkerEntry {
            until,
            expiry: self.expiry(ttl_seconds),
        };

        match self.markers.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expiry > now {
                    return Ok(false);
                }
                occupied.insert(marker);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(marker);
            }
        }
        Ok(true)
    }

    async fn get_marker(&self, key: &str) -> Result<Option<DateTime<Utc>>, AuthError> {
        let now = self.clock.now();
        Ok(self
            .markers
            .get(key)
            .filter(|entry| entry.expiry > now)
            .map(|entry| entry.until))
    }

    async fn delete_marker(&self, key: &str) -> Result<(), AuthError> {
        self.markers.remove(key);
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<SessionState>, AuthError> {
        let now = self.clock.now();
        Ok(self
            .sessions
            .get(session_id)
            .filter(|entry| entry.expiry > now)
            .map(|entry| entry.state.clone()))
    }

    async fn save_session(
        &self,
        session_id: &str,
        state: &SessionState,
        ttl_seconds: u64,
    ) -> Result<(), AuthError> {
        self.sessions.insert(
            session_id.to_string(),
            SessionEntry {
                state: state.clone(),
                expiry: self.expiry(ttl_seconds),
            },
        );
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), AuthError> {
        self.sessions.remove(session_id);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, AuthError> {
        let now = self.clock.now();
        let before = self.credentials.len()
            + self.counters.len()
            + self.events.len()
            + self.markers.len()
            + self.sessions.len();

        self.credentials
            .retain(|_, entry| entry.expiry > now && !entry.credential.is_expired(now));
        self.counters.retain(|_, entry| entry.expiry > now);
        self.events.retain(|_, log| log.expiry > now);
        self.markers.retain(|_, entry| entry.expiry > now);
        self.sessions.retain(|_, entry| entry.expiry > now);

        let after = self.credentials.len()
            + self.counters.len()
            + self.events.len()
            + self.markers.len()
            + self.sessions.len();
        Ok(before.saturating_sub(after))
    }
}
