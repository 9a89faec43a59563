use crate::credential::{Credential, Purpose};
use crate::errors::AuthError;
use crate::session::SessionState;
use crate::storage::Storage;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::AsyncCommands;
use uuid::Uuid;

// Deletes the credential only if its JSON still carries the submitted token.
const CONSUME_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if raw and cjson.decode(raw).token == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Redis-backed storage. Expiry is delegated to key TTLs, so `purge_expired`
/// has nothing to do.
pub struct RedisStorage {
    client: redis::Client,
}

impl RedisStorage {
    pub fn new(redis_url: &str) -> Result<Self, AuthError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    fn credential_key(principal_id: &str, purpose: Purpose) -> String {
        format!("otp:cred:{}:{}", principal_id, purpose)
    }

    fn counter_key(key: &str) -> String {
        format!("otp:count:{}", key)
    }

    fn events_key(key: &str) -> String {
        format!("otp:events:{}", key)
    }

    fn marker_key(key: &str) -> String {
        format!("otp:mark:{}", key)
    }

    fn session_key(session_id: &str) -> String {
        format!("otp:session:{}", session_id)
    }

    fn decode_marker(raw: Option<i64>) -> Option<DateTime<Utc>> {
        raw.and_then(|ts| Utc.timestamp_opt(ts, 0).single())
    }

    fn decode_event(score: f64) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(score as i64).single()
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn put_credential(
        &self,
        credential: &Credential,
        ttl_seconds: u64,
    ) -> Result<(), AuthError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = Self::credential_key(&credential.principal_id, credential.purpose);
        let value = serde_json::to_string(credential)?;
        conn.set_ex::<_, _, ()>(key, value, ttl_seconds).await?;
        Ok(())
    }

    async fn get_credential(
        &self,
        principal_id: &str,
        purpose: Purpose,
    ) -> Result<Option<Credential>, AuthError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Option<String> = conn.get(Self::credential_key(principal_id, purpose)).await?;
        raw.map(|value| serde_json::from_str(&value))
            .transpose()
            .map_err(AuthError::from)
    }

    async fn delete_credential(
        &self,
        principal_id: &str,
        purpose: Purpose,
    ) -> Result<(), AuthError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.del::<_, ()>(Self::credential_key(principal_id, purpose))
            .await?;
        Ok(())
    }

    async fn consume_credential(
        &self,
        principal_id: &str,
        purpose: Purpose,
        token: &str,
    ) -> Result<bool, AuthError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let removed: i64 = redis::Script::new(CONSUME_SCRIPT)
            .key(Self::credential_key(principal_id, purpose))
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn increment_counter(&self, key: &str, ttl_seconds: u64) -> Result<u32, AuthError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = Self::counter_key(key);
        let count: u32 = conn.incr(&key, 1).await?;
        if count == 1 {
            conn.expire::<_, ()>(&key, ttl_seconds as i64).await?;
        }
        Ok(count)
    }

    async fn get_counter(&self, key: &str) -> Result<u32, AuthError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let count: Option<u32> = conn.get(Self::counter_key(key)).await?;
        Ok(count.unwrap_or(0))
    }

    async fn delete_counter(&self, key: &str) -> Result<(), AuthError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.del::<_, ()>(Self::counter_key(key)).await?;
        Ok(())
    }

    async fn record_event(
        &self,
        key: &str,
        at: DateTime<Utc>,
        since: DateTime<Utc>,
        ttl_seconds: u64,
    ) -> Result<u32, AuthError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = Self::events_key(key);
        let at_ms = at.timestamp_millis();
        // members must be unique even when two events share a millisecond
        let member = format!("{}:{}", at_ms, Uuid::new_v4());

        let (count,): (u32,) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg("-inf")
            .arg(since.timestamp_millis())
            .ignore()
            .cmd("ZADD")
            .arg(&key)
            .arg(at_ms)
            .arg(member)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(ttl_seconds)
            .ignore()
            .cmd("ZCARD")
            .arg(&key)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn list_events(
        &self,
        key: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, AuthError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let scored: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(Self::events_key(key))
            .arg(format!("({}", since.timestamp_millis()))
            .arg("+inf")
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(scored
            .into_iter()
            .filter_map(|(_, score)| Self::decode_event(score))
            .collect())
    }

    async fn delete_events(&self, key: &str) -> Result<(), AuthError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.del::<_, ()>(Self::events_key(key)).await?;
        Ok(())
    }

    async fn set_marker(
        &self,
        key: &str,
        until: DateTime<Utc>,
        ttl_seconds: u64,
    ) -> Result<(), AuthError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.set_ex::<_, _, ()>(Self::marker_key(key), until.timestamp(), ttl_seconds)
            .await?;
        Ok(())
    }

    async fn set_marker_if_absent(
        &self,
        key: &str,
        until: DateTime<Utc>,
        ttl_seconds: u64,
    ) -> Result<bool, AuthError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(Self::marker_key(key))
            .arg(until.timestamp())
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn get_marker(&self, key: &str) -> Result<Option<DateTime<Utc>>, AuthError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Option<i64> = conn.get(Self::marker_key(key)).await?;
        Ok(Self::decode_marker(raw))
    }

    async fn delete_marker(&self, key: &str) -> Result<(), AuthError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.del::<_, ()>(Self::marker_key(key)).await?;
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<SessionState>, AuthError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Option<String> = conn.get(Self::session_key(session_id)).await?;
        raw.map(|value| serde_json::from_str(&value))
            .transpose()
            .map_err(AuthError::from)
    }

    async fn save_session(
        &self,
        session_id: &str,
        state: &SessionState,
        ttl_seconds: u64,
    ) -> Result<(), AuthError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let value = serde_json::to_string(state)?;
        conn.set_ex::<_, _, ()>(Self::session_key(session_id), value, ttl_seconds)
            .await?;
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), AuthError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.del::<_, ()>(Self::session_key(session_id)).await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, AuthError> {
        Ok(0)
    }
}
