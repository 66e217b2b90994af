//! Durable cache tier.
//!
//! Values survive a process restart. Redis is used when configured; otherwise
//! an in-process map stands in so the engine runs with the fast tier only
//! semantics of a fresh reload.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::RedisConfig;

const KEY_PREFIX: &str = "clash:";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    RedisError(String),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::RedisError(err.to_string())
    }
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn save(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
    async fn clear(&self) -> Result<(), StoreError>;
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Redis-backed durable tier.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
}

impl RedisStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    fn namespaced(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }
}

#[async_trait]
impl DurableStore for RedisStore {
    async fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(Self::namespaced(key)).await?;
        Ok(value)
    }

    async fn save(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let _: () = conn
            .set_ex(Self::namespaced(key), value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let _: () = conn.del(Self::namespaced(key)).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let pattern = format!("{}*", KEY_PREFIX);
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                let _: () = conn.del(keys).await?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// Process-local durable tier used without Redis and in tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    // Expiry is judged from the record's own timestamp on load.
    async fn save(&self, key: &str, value: String, _ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Build the durable tier from configuration.
pub async fn create_store(config: &RedisConfig) -> Result<std::sync::Arc<dyn DurableStore>, StoreError> {
    match &config.url {
        Some(url) => {
            let client = redis::Client::open(url.as_str())?;
            let manager = ConnectionManager::new(client).await?;
            info!("Durable cache tier backed by Redis");
            Ok(std::sync::Arc::new(RedisStore::new(manager)))
        }
        None => {
            debug!("REDIS_URL not set, durable cache tier is in-memory");
            Ok(std::sync::Arc::new(MemoryStore::new()))
        }
    }
}

pub async fn health_check(store: &dyn DurableStore) -> Result<(), StoreError> {
    store.ping().await
}
