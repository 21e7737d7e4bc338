// Cache layer
//
// The cache is an optimization only. Reads that fail are treated as misses and writes
// that fail are dropped, so the engine produces the same answers with the cache gone.
// Promo codes and usage counters are never cached.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::promotions::{error::PResult, metrics::PerformanceMetrics};

/// Key for the active shipping configuration
pub const SHIPPING_CONFIG_KEY: &str = "shipping:active";

/// Key for an event's rule list
pub fn event_rules_key(event_id: i32) -> String {
    format!("events:rules:{}", event_id)
}

/// Key for candidate events of a product within one minute bucket
pub fn product_events_key(product_id: i32, minute_bucket: i64) -> String {
    format!("events:product:{}:{}", product_id, minute_bucket)
}

/// Key/value cache with per-entry TTL
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> PResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> PResult<()>;

    /// Remove `pattern`; a trailing `*` removes every key with that prefix
    async fn invalidate(&self, pattern: &str) -> PResult<()>;
}

/// Redis-backed cache
#[derive(Clone)]
pub struct RedisCache {
    connection: ConnectionManager,
}

impl RedisCache {
    /// Connect to Redis and keep a self-healing connection
    pub async fn connect(url: &str) -> PResult<Self> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        tracing::info!("Connected to Redis cache");
        Ok(Self { connection })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> PResult<Option<String>> {
        let mut connection = self.connection.clone();
        let value = redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<String>>(&mut connection)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> PResult<()> {
        let mut connection = self.connection.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut connection)
            .await?;
        Ok(())
    }

    async fn invalidate(&self, pattern: &str) -> PResult<()> {
        let mut connection = self.connection.clone();

        if !pattern.ends_with('*') {
            redis::cmd("DEL")
                .arg(pattern)
                .query_async::<_, ()>(&mut connection)
                .await?;
            return Ok(());
        }

        let keys = redis::cmd("KEYS")
            .arg(pattern)
            .query_async::<_, Vec<String>>(&mut connection)
            .await?;
        if !keys.is_empty() {
            redis::cmd("DEL")
                .arg(&keys)
                .query_async::<_, ()>(&mut connection)
                .await?;
        }
        Ok(())
    }
}

/// Process-local cache with expiry timestamps
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, (String, Instant)>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> PResult<Option<String>> {
        // Fast path under the read lock
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some((value, expires_at)) if Instant::now() < *expires_at => {
                    return Ok(Some(value.clone()));
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Expired: drop it
        let mut entries = self.entries.write().await;
        if matches!(entries.get(key), Some((_, expires_at)) if Instant::now() >= *expires_at) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> PResult<()> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn invalidate(&self, pattern: &str) -> PResult<()> {
        let mut entries = self.entries.write().await;
        match pattern.strip_suffix('*') {
            Some(prefix) => entries.retain(|key, _| !key.starts_with(prefix)),
            None => {
                entries.remove(pattern);
            }
        }
        Ok(())
    }
}

/// Read a JSON value, treating every cache fault as a miss
pub async fn get_json<T: DeserializeOwned>(
    cache: Option<&dyn Cache>,
    key: &str,
    metrics: &PerformanceMetrics,
) -> Option<T> {
    let cache = cache?;

    let raw = match cache.get(key).await {
        Ok(Some(raw)) => raw,
        Ok(None) => {
            metrics.record_cache_miss();
            return None;
        }
        Err(e) => {
            tracing::warn!("Cache read failed for {}: {}", key, e);
            metrics.record_cache_miss();
            return None;
        }
    };

    match serde_json::from_str(&raw) {
        Ok(value) => {
            metrics.record_cache_hit();
            Some(value)
        }
        Err(e) => {
            tracing::warn!("Discarding undecodable cache entry {}: {}", key, e);
            metrics.record_cache_miss();
            None
        }
    }
}

/// Write a JSON value; failures are logged and dropped
pub async fn put_json<T: Serialize>(cache: Option<&dyn Cache>, key: &str, value: &T, ttl: Duration) {
    let Some(cache) = cache else {
        return;
    };

    let raw = match serde_json::to_string(value) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!("Could not encode cache entry {}: {}", key, e);
            return;
        }
    };

    if let Err(e) = cache.set(key, &raw, ttl).await {
        tracing::warn!("Cache write failed for {}: {}", key, e);
    }
}
