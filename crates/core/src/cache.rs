//! Redis-backed cache, counters and locks.
//!
//! Redis is optional at runtime: callers hold an `Option<Cache>` and fall
//! back to Postgres (or in-process limits) when it is absent.

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

pub const KEY_PREFIX: &str = "clovadrop";

pub fn token_key(download_token: &str) -> String {
    format!("{}:token:{}", KEY_PREFIX, download_token)
}

pub fn lock_key(name: &str) -> String {
    format!("{}:lock:{}", KEY_PREFIX, name)
}

/// Cached archive listing, keyed by content so edits never serve stale entries
pub fn entries_key(file_id: Uuid, content_hash: &str) -> String {
    format!("{}:entries:{}:{}", KEY_PREFIX, file_id, content_hash)
}

pub fn entries_pattern(file_id: Uuid) -> String {
    format!("{}:entries:{}:*", KEY_PREFIX, file_id)
}

pub fn rate_key(class: &str, client: &str) -> String {
    format!("{}:rate:{}:{}", KEY_PREFIX, class, client)
}

#[derive(Clone)]
pub struct Cache {
    conn: ConnectionManager,
}

impl Cache {
    pub async fn new(redis_url: &str) -> Result<Self, RedisError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    /// A handle on the shared multiplexed connection
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    pub async fn is_available(&self) -> bool {
        let mut conn = self.conn.clone();
        let pong: Result<String, RedisError> = redis::cmd("PING").query_async(&mut conn).await;
        pong.is_ok()
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, RedisError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        Ok(raw.and_then(|s| match serde_json::from_str(&s) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(key = key, error = %e, "Discarding undecodable cache entry");
                None
            }
        }))
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) -> Result<(), RedisError> {
        if ttl_secs == 0 {
            return Ok(());
        }
        let payload = match serde_json::to_string(value) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(key = key, error = %e, "Skipping cache write for unserializable value");
                return Ok(());
            }
        };
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, payload, ttl_secs).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), RedisError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await
    }

    /// Delete every key matching a glob pattern, returns the number removed
    pub async fn delete_pattern(&self, pattern: &str) -> Result<usize, RedisError> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut removed = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                removed += keys.len();
                conn.del::<_, ()>(keys).await?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(removed)
    }

    /// Cache the download-token -> file id mapping
    pub async fn cache_token(&self, download_token: &str, file_id: Uuid, ttl_secs: u64) -> Result<(), RedisError> {
        self.set_json(&token_key(download_token), &file_id, ttl_secs).await
    }

    pub async fn cached_token(&self, download_token: &str) -> Result<Option<Uuid>, RedisError> {
        self.get_json(&token_key(download_token)).await
    }

    pub async fn forget_token(&self, download_token: &str) -> Result<(), RedisError> {
        self.delete(&token_key(download_token)).await
    }

    /// Fixed-window counter. Returns (hits in window, seconds until reset).
    pub async fn hit_window(&self, key: &str, window_secs: u64) -> Result<(u64, u64), RedisError> {
        let mut conn = self.conn.clone();
        let (count, ttl): (i64, i64) = redis::pipe()
            .atomic()
            .cmd("SET").arg(key).arg(0).arg("EX").arg(window_secs).arg("NX").ignore()
            .cmd("INCR").arg(key)
            .cmd("TTL").arg(key)
            .query_async(&mut conn)
            .await?;
        let ttl = if ttl < 0 { window_secs } else { ttl as u64 };
        Ok((count.max(0) as u64, ttl))
    }

    /// Try to take a named lock. The holder id must be presented to release it.
    pub async fn try_lock(&self, name: &str, holder: &str, ttl_secs: u64) -> Result<bool, RedisError> {
        let mut conn = self.conn.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(lock_key(name))
            .arg(holder)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }

    /// Release a lock only if we still hold it
    pub async fn release_lock(&self, name: &str, holder: &str) -> Result<bool, RedisError> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(
            r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("DEL", KEYS[1])
            end
            return 0
            "#,
        );
        let deleted: i64 = script
            .key(lock_key(name))
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(token_key("abc"), "clovadrop:token:abc");
        assert_eq!(lock_key("cleanup"), "clovadrop:lock:cleanup");
        assert_eq!(rate_key("upload", "1.2.3.4"), "clovadrop:rate:upload:1.2.3.4");
    }

    #[test]
    fn entry_listing_keys_match_their_pattern() {
        let id = Uuid::nil();
        let key = entries_key(id, "abc123");
        let pattern = entries_pattern(id);
        assert!(key.starts_with(pattern.trim_end_matches('*')));
        assert!(key.ends_with(":abc123"));
    }
}
