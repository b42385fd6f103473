//! The coordination store client (§4.4): a typed wrapper over the shared
//! KV store (Redis) providing service registry, tab-capacity reservation,
//! per-fingerprint render locks, and cache-metadata hash operations.
//!
//! All multi-step operations that must be atomic (tab reservation, lock
//! release) are single Lua scripts -- the store is the only
//! strong-consistency point in the system (§5) and nothing here may
//! assume a second round-trip completes before a peer observes the first.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Per-RS registration record (§3 Service Record).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub capacity: usize,
    pub status: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Outcome of a tab reservation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TabReservation {
    Reserved(String),
    Exhausted,
}

/// Outcome of a render-lock acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    AlreadyHeld,
}

fn service_key(id: &str) -> String {
    format!("service:render:{id}")
}
fn tabs_key(rs_id: &str) -> String {
    format!("tabs:{rs_id}")
}
fn lock_key(fp: u64) -> String {
    format!("lock:cache:{fp:016x}")
}
fn meta_key(cache_key: &str) -> String {
    format!("meta:{cache_key}")
}
fn service_index_key() -> &'static str {
    "services:index"
}
fn eg_ids_key(cache_key: &str) -> String {
    format!("egids:{cache_key}")
}

/// Typed operations over the coordination store (§4.4). Behind a trait so
/// the pipeline can be tested against an in-memory fake (§13).
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn register_service(&self, record: &ServiceRecord, ttl: Duration) -> Result<()>;
    async fn heartbeat(&self, id: &str, ttl: Duration) -> Result<()>;
    async fn deregister_service(&self, id: &str) -> Result<()>;
    async fn list_services(&self) -> Result<Vec<ServiceRecord>>;

    async fn reserve_tab(&self, rs_id: &str, token: &str) -> Result<TabReservation>;
    async fn release_tab(&self, rs_id: &str, tab_id: &str, token: &str) -> Result<()>;
    async fn init_tabs(&self, rs_id: &str, capacity: usize) -> Result<()>;

    async fn acquire_render_lock(&self, fp: u64, holder: &str, ttl: Duration) -> Result<LockOutcome>;
    async fn release_render_lock(&self, fp: u64, holder: &str) -> Result<()>;

    async fn get_metadata(&self, cache_key: &str) -> Result<Option<HashMap<String, String>>>;
    async fn put_metadata(&self, cache_key: &str, fields: HashMap<String, String>, ttl: Duration) -> Result<()>;
    /// Write `fields` only if doing so does not violate the Priority Rule:
    /// a `bypass`-source write must never overwrite a `render`-source entry
    /// (§4.5). Returns whether the write happened.
    async fn put_metadata_guarded(
        &self,
        cache_key: &str,
        fields: HashMap<String, String>,
        ttl: Duration,
        incoming_source: &str,
    ) -> Result<bool>;
    async fn update_field(&self, cache_key: &str, field: &str, value: &str) -> Result<()>;
    async fn expire_metadata_at(&self, cache_key: &str, expires_at_unix: i64) -> Result<()>;

    async fn get_service_ids(&self, cache_key: &str) -> Result<Vec<String>>;
    async fn set_service_ids(&self, cache_key: &str, ids: &[String]) -> Result<()>;
    async fn add_service_id(&self, cache_key: &str, id: &str) -> Result<()>;
}

/// Redis-backed implementation.
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool.get().await.map_err(|e| Error::Store(format!("pool checkout: {e}")))
    }
}

const RESERVE_TAB_SCRIPT: &str = r#"
local fields = redis.call('HKEYS', KEYS[1])
table.sort(fields)
for _, f in ipairs(fields) do
    local v = redis.call('HGET', KEYS[1], f)
    if v == '' then
        redis.call('HSET', KEYS[1], f, ARGV[1])
        return f
    end
end
return false
"#;

const RELEASE_TAB_SCRIPT: &str = r#"
local cur = redis.call('HGET', KEYS[1], ARGV[2])
if cur == ARGV[1] then
    redis.call('HSET', KEYS[1], ARGV[2], '')
    return 1
end
return 0
"#;

// ARGV[1] = incoming source, ARGV[2] = ttl seconds, ARGV[3..] = field/value pairs.
const PUT_METADATA_GUARDED_SCRIPT: &str = r#"
local existing_source = redis.call('HGET', KEYS[1], 'source')
if existing_source == 'render' and ARGV[1] == 'bypass' then
    return 0
end
for i = 3, #ARGV, 2 do
    redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
redis.call('EXPIRE', KEYS[1], tonumber(ARGV[2]))
return 1
"#;

const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn register_service(&self, record: &ServiceRecord, ttl: Duration) -> Result<()> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(record).map_err(|e| Error::Internal(e.to_string()))?;
        let _: () = conn.set_ex(service_key(&record.id), payload, ttl.as_secs()).await?;
        let _: () = conn.sadd(service_index_key(), &record.id).await?;
        Ok(())
    }

    async fn heartbeat(&self, id: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn().await?;
        let renewed: bool = conn.expire(service_key(id), ttl.as_secs() as i64).await?;
        if !renewed {
            return Err(Error::NotFound(format!("service {id} not registered")));
        }
        Ok(())
    }

    async fn deregister_service(&self, id: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(service_key(id)).await?;
        let _: () = conn.srem(service_index_key(), id).await?;
        Ok(())
    }

    async fn list_services(&self) -> Result<Vec<ServiceRecord>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.smembers(service_index_key()).await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let raw: Option<String> = conn.get(service_key(&id)).await?;
            match raw {
                Some(raw) => {
                    if let Ok(record) = serde_json::from_str::<ServiceRecord>(&raw) {
                        out.push(record);
                    }
                }
                None => {
                    // TTL expired between SMEMBERS and GET; drop the stale index entry.
                    let _: () = conn.srem(service_index_key(), &id).await?;
                }
            }
        }
        Ok(out)
    }

    async fn init_tabs(&self, rs_id: &str, capacity: usize) -> Result<()> {
        let mut conn = self.conn().await?;
        let key = tabs_key(rs_id);
        let fields: Vec<(String, String)> =
            (0..capacity).map(|i| (format!("tab{i}"), String::new())).collect();
        if !fields.is_empty() {
            let _: () = conn.hset_multiple(&key, &fields).await?;
        }
        Ok(())
    }

    async fn reserve_tab(&self, rs_id: &str, token: &str) -> Result<TabReservation> {
        let mut conn = self.conn().await?;
        let script = redis::Script::new(RESERVE_TAB_SCRIPT);
        let result: redis::Value = script
            .key(tabs_key(rs_id))
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        match result {
            redis::Value::BulkString(bytes) => {
                Ok(TabReservation::Reserved(String::from_utf8_lossy(&bytes).into_owned()))
            }
            redis::Value::SimpleString(s) => Ok(TabReservation::Reserved(s)),
            _ => Ok(TabReservation::Exhausted),
        }
    }

    async fn release_tab(&self, rs_id: &str, tab_id: &str, token: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let script = redis::Script::new(RELEASE_TAB_SCRIPT);
        let _: i64 = script
            .key(tabs_key(rs_id))
            .arg(token)
            .arg(tab_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn acquire_render_lock(&self, fp: u64, holder: &str, ttl: Duration) -> Result<LockOutcome> {
        let mut conn = self.conn().await?;
        let opts = redis::SetOptions::default()
            .conditional_set(redis::ExistenceCheck::NX)
            .with_expiration(redis::SetExpiry::EX(ttl.as_secs()));
        let acquired: Option<String> = conn.set_options(lock_key(fp), holder, opts).await?;
        Ok(if acquired.is_some() { LockOutcome::Acquired } else { LockOutcome::AlreadyHeld })
    }

    async fn release_render_lock(&self, fp: u64, holder: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let script = redis::Script::new(RELEASE_LOCK_SCRIPT);
        let _: i64 = script.key(lock_key(fp)).arg(holder).invoke_async(&mut conn).await?;
        Ok(())
    }

    async fn get_metadata(&self, cache_key: &str) -> Result<Option<HashMap<String, String>>> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> = conn.hgetall(meta_key(cache_key)).await?;
        if fields.is_empty() {
            Ok(None)
        } else {
            Ok(Some(fields))
        }
    }

    async fn put_metadata(&self, cache_key: &str, fields: HashMap<String, String>, ttl: Duration) -> Result<()> {
        let mut conn = self.conn().await?;
        let key = meta_key(cache_key);
        let pairs: Vec<(String, String)> = fields.into_iter().collect();
        let _: () = conn.hset_multiple(&key, &pairs).await?;
        let _: () = conn.expire(&key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn put_metadata_guarded(
        &self,
        cache_key: &str,
        fields: HashMap<String, String>,
        ttl: Duration,
        incoming_source: &str,
    ) -> Result<bool> {
        let mut conn = self.conn().await?;
        let script = redis::Script::new(PUT_METADATA_GUARDED_SCRIPT);
        let mut invocation = script.key(meta_key(cache_key)).arg(incoming_source).arg(ttl.as_secs());
        for (field, value) in fields {
            invocation = invocation.arg(field).arg(value);
        }
        let wrote: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(wrote == 1)
    }

    async fn update_field(&self, cache_key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.hset(meta_key(cache_key), field, value).await?;
        Ok(())
    }

    async fn expire_metadata_at(&self, cache_key: &str, expires_at_unix: i64) -> Result<()> {
        self.update_field(cache_key, "expires_at", &expires_at_unix.to_string()).await
    }

    async fn get_service_ids(&self, cache_key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.smembers(eg_ids_key(cache_key)).await?;
        Ok(ids)
    }

    async fn set_service_ids(&self, cache_key: &str, ids: &[String]) -> Result<()> {
        let mut conn = self.conn().await?;
        let key = eg_ids_key(cache_key);
        let _: () = conn.del(&key).await?;
        if !ids.is_empty() {
            let _: () = conn.sadd(&key, ids).await?;
        }
        Ok(())
    }

    async fn add_service_id(&self, cache_key: &str, id: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.sadd(eg_ids_key(cache_key), id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_the_documented_scheme() {
        assert_eq!(service_key("rs1"), "service:render:rs1");
        assert_eq!(tabs_key("rs1"), "tabs:rs1");
        assert_eq!(lock_key(0xdead_beef), "lock:cache:00000000deadbeef");
        assert_eq!(meta_key("cache:1:2:00000000deadbeef"), "meta:cache:1:2:00000000deadbeef");
    }

    #[test]
    fn tab_reservation_outcomes_are_distinguishable() {
        assert_ne!(
            TabReservation::Reserved("tab0".into()),
            TabReservation::Exhausted
        );
    }
}
