//! Redis-backed L2 distributed cache (feature `redis-cache`).

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::debug;

use eventflow_core::{EngineError, EngineResult, TransientKind};

use crate::query::cache::{CachedValue, DistributedCache};

#[derive(Debug, Clone)]
pub struct RedisCacheConfig {
    pub url: String,
    /// Prefix applied to every key and tag set
    pub key_prefix: String,
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "eventflow".to_string(),
        }
    }
}

/// Distributed cache on Redis with tag sets for key resolution.
pub struct RedisDistributedCache {
    manager: ConnectionManager,
    config: RedisCacheConfig,
}

impl RedisDistributedCache {
    pub async fn connect(config: RedisCacheConfig) -> EngineResult<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| EngineError::Configuration {
                message: format!("invalid redis url: {}", e),
            })?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| map_redis_error("redis_connect", e))?;
        debug!(prefix = %config.key_prefix, "redis distributed cache connected");
        Ok(Self { manager, config })
    }

    fn value_key(&self, key: &str) -> String {
        format!("{}:v:{}", self.config.key_prefix, key)
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}:t:{}", self.config.key_prefix, tag)
    }
}

fn map_redis_error(operation: &str, error: redis::RedisError) -> EngineError {
    if error.is_connection_refusal() || error.is_connection_dropped() || error.is_timeout() {
        EngineError::transient(TransientKind::ConnectionReset, operation, error.to_string())
    } else {
        EngineError::storage(operation, error.to_string())
    }
}

#[async_trait]
impl DistributedCache for RedisDistributedCache {
    fn name(&self) -> &str {
        "redis-l2"
    }

    async fn get(&self, key: &str) -> EngineResult<Option<CachedValue>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.value_key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("l2_get", e))?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &CachedValue, ttl: Duration) -> EngineResult<()> {
        let mut conn = self.manager.clone();
        let serialized = serde_json::to_string(value)?;
        let ttl_seconds = ttl.as_secs().max(1);

        redis::cmd("SETEX")
            .arg(self.value_key(key))
            .arg(ttl_seconds)
            .arg(serialized)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| map_redis_error("l2_set", e))?;

        // Tag sets outlive their values slightly so invalidation can still
        // resolve keys for entries that just expired.
        for tag in &value.tags {
            redis::cmd("SADD")
                .arg(self.tag_key(tag))
                .arg(key)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(|e| map_redis_error("l2_tag", e))?;
            redis::cmd("EXPIRE")
                .arg(self.tag_key(tag))
                .arg(ttl_seconds * 2)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(|e| map_redis_error("l2_tag", e))?;
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> EngineResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(self.value_key(key));
        }
        cmd.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| map_redis_error("l2_delete", e))?;
        Ok(())
    }

    async fn keys_for_tags(&self, tags: &[String]) -> EngineResult<Option<Vec<String>>> {
        let mut conn = self.manager.clone();
        let mut keys = Vec::new();
        for tag in tags {
            let members: Vec<String> = redis::cmd("SMEMBERS")
                .arg(self.tag_key(tag))
                .query_async(&mut conn)
                .await
                .map_err(|e| map_redis_error("l2_keys_for_tags", e))?;
            keys.extend(members);
        }
        keys.sort();
        keys.dedup();
        Ok(Some(keys))
    }
}
