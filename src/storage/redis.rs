//! Redis-backed key-value store
//!
//! Keys are namespaced with a configurable prefix. Compare-and-swap runs as a
//! Lua script so the read and the write happen in one round trip on the server.

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Connection, Pool, Runtime};
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::{KvStore, StoreError, StoreResult};

const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then return 0 end
else
  if current then return 0 end
end
if tonumber(ARGV[4]) > 0 then
  redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
else
  redis.call('SET', KEYS[1], ARGV[3])
end
return 1
"#;

const HASH_CAS_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
if ARGV[2] == '1' then
  if current ~= ARGV[3] then return 0 end
else
  if current then return 0 end
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[4])
return 1
"#;

/// Redis connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis URL (e.g., redis://localhost:6379)
    pub url: String,

    /// Connection pool size
    pub pool_size: usize,

    /// Key prefix for namespacing
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            key_prefix: "resenha".to_string(),
        }
    }
}

impl RedisConfig {
    /// Build a connection pool for these settings
    pub fn create_pool(&self) -> StoreResult<Pool> {
        PoolConfig::from_url(&self.url)
            .builder()
            .map_err(|e| StoreError::backend(format!("failed to create pool builder: {e}")))?
            .max_size(self.pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| StoreError::backend(format!("failed to create Redis pool: {e}")))
    }

    /// Prefix a key with the configured namespace
    pub fn namespaced(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{key}", self.key_prefix)
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::backend(err)
    }
}

/// [`KvStore`] over a Redis connection pool
#[derive(Clone)]
pub struct RedisKv {
    pool: Pool,
    config: RedisConfig,
    cas: std::sync::Arc<Script>,
    hash_cas: std::sync::Arc<Script>,
}

impl RedisKv {
    /// Connect and verify the server answers
    pub async fn connect(config: &RedisConfig) -> StoreResult<Self> {
        let pool = config.create_pool()?;
        let kv = Self::with_pool(pool, config.clone());
        kv.ping().await?;
        tracing::info!(url = %config.url, "Connected to Redis");
        Ok(kv)
    }

    /// Wrap an existing pool
    pub fn with_pool(pool: Pool, config: RedisConfig) -> Self {
        Self {
            pool,
            config,
            cas: std::sync::Arc::new(Script::new(CAS_SCRIPT)),
            hash_cas: std::sync::Arc::new(Script::new(HASH_CAS_SCRIPT)),
        }
    }

    /// Underlying pool, shared with the Redis queue adapter
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn conn(&self) -> StoreResult<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::backend(format!("failed to get Redis connection: {e}")))
    }

    fn key(&self, key: &str) -> String {
        self.config.namespaced(key)
    }
}

fn expected_args(expected: Option<&str>) -> (&'static str, &str) {
    match expected {
        Some(value) => ("1", value),
        None => ("0", ""),
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.get(self.key(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let key = self.key(key);
        match ttl {
            Some(ttl) => {
                let millis = ttl.as_millis().max(1) as u64;
                conn.pset_ex::<_, _, ()>(key, value, millis).await?;
            }
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.del(self.key(key)).await?;
        Ok(removed > 0)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let (has_expected, expected) = expected_args(expected);
        let ttl_ms = ttl.map_or(0, |t| t.as_millis().max(1) as u64);
        let swapped: i64 = self
            .cas
            .key(self.key(key))
            .arg(has_expected)
            .arg(expected)
            .arg(new)
            .arg(ttl_ms)
            .invoke_async(&mut *conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn hash_get_all(&self, hash: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> = conn.hgetall(self.key(hash)).await?;
        Ok(fields)
    }

    async fn hash_set(&self, hash: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        conn.hset::<_, _, _, ()>(self.key(hash), field, value).await?;
        Ok(())
    }

    async fn hash_compare_and_swap(
        &self,
        hash: &str,
        field: &str,
        expected: Option<&str>,
        new: &str,
    ) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let (has_expected, expected) = expected_args(expected);
        let swapped: i64 = self
            .hash_cas
            .key(self.key(hash))
            .arg(field)
            .arg(has_expected)
            .arg(expected)
            .arg(new)
            .invoke_async(&mut *conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RedisConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.pool_size, 10);
    }

    #[test]
    fn test_namespaced_keys() {
        let config = RedisConfig::default();
        assert_eq!(config.namespaced("p1_es_page"), "resenha:p1_es_page");

        let bare = RedisConfig {
            key_prefix: String::new(),
            ..Default::default()
        };
        assert_eq!(bare.namespaced("vpns"), "vpns");
    }

    #[tokio::test]
    #[ignore = "Requires running Redis"]
    async fn test_redis_compare_and_swap() {
        let config = RedisConfig {
            key_prefix: format!("resenha-test-{}", uuid::Uuid::new_v4()),
            ..Default::default()
        };
        let kv = RedisKv::connect(&config).await.unwrap();

        assert!(kv.compare_and_swap("k", None, "1", None).await.unwrap());
        assert!(!kv.compare_and_swap("k", None, "2", None).await.unwrap());
        assert!(kv.compare_and_swap("k", Some("1"), "2", None).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("2"));

        kv.hash_set("h", "a", "1").await.unwrap();
        assert!(kv.hash_compare_and_swap("h", "a", Some("1"), "3").await.unwrap());
        assert_eq!(kv.hash_get_all("h").await.unwrap()["a"], "3");

        kv.delete("k").await.unwrap();
        kv.delete("h").await.unwrap();
    }
}
