//! # Redis Store
//!
//! Redis implementation of [`KvStore`] over a connection manager, with retry
//! and reconnect on failure.

use super::KvStore;
use crate::core::config::RedisSettings;
use crate::core::error::{CacheError, CacheResult};
use async_trait::async_trait;
use futures::future::BoxFuture;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Keys fetched per SCAN round trip
const SCAN_BATCH: usize = 1000;

/// Redis store implementation
pub struct RedisStore {
    settings: RedisSettings,

    /// Redis connection manager
    connection_manager: Arc<RwLock<ConnectionManager>>,

    connection_errors: Arc<AtomicU64>,
}

impl RedisStore {
    /// Connect to the configured server
    pub async fn connect(settings: RedisSettings) -> CacheResult<Self> {
        let client = Client::open(settings.url.as_str())?;
        let connection_manager = ConnectionManager::new(client).await?;

        info!("Redis cache store connected to {}", settings.url);

        Ok(Self {
            settings,
            connection_manager: Arc::new(RwLock::new(connection_manager)),
            connection_errors: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Number of failed commands since connecting
    pub fn connection_errors(&self) -> u64 {
        self.connection_errors.load(Ordering::Relaxed)
    }

    /// Execute a Redis operation with retry logic
    async fn execute_with_retry<F, T>(&self, operation: F) -> CacheResult<T>
    where
        F: Fn(ConnectionManager) -> BoxFuture<'static, RedisResult<T>> + Send + Sync,
        T: Send,
    {
        let mut retries = 0;

        loop {
            // ConnectionManager is a cheap handle onto a shared multiplexed connection
            let conn = self.connection_manager.read().await.clone();

            match operation(conn).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    error!("Redis operation failed: {}", e);
                    self.connection_errors.fetch_add(1, Ordering::Relaxed);

                    if retries >= self.settings.max_retries {
                        return Err(CacheError::Redis(e));
                    }

                    retries += 1;
                    tokio::time::sleep(self.settings.retry_delay * retries).await;

                    if let Err(reconnect_err) = self.reconnect().await {
                        warn!("Failed to reconnect to Redis: {}", reconnect_err);
                    }
                }
            }
        }
    }

    /// Reconnect to Redis
    async fn reconnect(&self) -> CacheResult<()> {
        let client = Client::open(self.settings.url.as_str())?;
        let new_connection_manager = ConnectionManager::new(client).await?;

        let mut conn = self.connection_manager.write().await;
        *conn = new_connection_manager;

        info!("Reconnected to Redis");
        Ok(())
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let key = key.to_string();
        self.execute_with_retry(move |mut conn| {
            let key = key.clone();
            Box::pin(async move { conn.get::<_, Option<Vec<u8>>>(&key).await })
        })
        .await
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        // SETEX rejects a zero expiry
        let ttl_seconds = ttl.as_secs().max(1);
        let key = key.to_string();
        let value = value.to_vec();

        self.execute_with_retry(move |mut conn| {
            let key = key.clone();
            let value = value.clone();
            Box::pin(async move { conn.set_ex::<_, _, ()>(&key, &value, ttl_seconds).await })
        })
        .await?;

        debug!("Set Redis key with TTL of {}s", ttl_seconds);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<u64> {
        let key = key.to_string();
        self.execute_with_retry(move |mut conn| {
            let key = key.clone();
            Box::pin(async move { conn.del::<_, u64>(&key).await })
        })
        .await
    }

    async fn keys_matching(&self, pattern: &str) -> CacheResult<Vec<String>> {
        // SCAN instead of KEYS so large keyspaces do not block the server
        let pattern = pattern.to_string();
        self.execute_with_retry(move |mut conn| {
            let pattern = pattern.clone();
            Box::pin(async move {
                let mut cursor: u64 = 0;
                let mut all_keys = Vec::new();

                loop {
                    let (new_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn)
                        .await?;

                    all_keys.extend(keys);

                    if new_cursor == 0 {
                        break;
                    }
                    cursor = new_cursor;
                }

                Ok::<Vec<String>, redis::RedisError>(all_keys)
            })
        })
        .await
    }

    async fn set_add(&self, set_key: &str, member: &str) -> CacheResult<()> {
        let set_key = set_key.to_string();
        let member = member.to_string();
        self.execute_with_retry(move |mut conn| {
            let set_key = set_key.clone();
            let member = member.clone();
            Box::pin(async move { conn.sadd::<_, _, ()>(&set_key, &member).await })
        })
        .await
    }

    async fn set_remove(&self, set_key: &str, member: &str) -> CacheResult<()> {
        let set_key = set_key.to_string();
        let member = member.to_string();
        self.execute_with_retry(move |mut conn| {
            let set_key = set_key.clone();
            let member = member.clone();
            Box::pin(async move { conn.srem::<_, _, ()>(&set_key, &member).await })
        })
        .await
    }

    async fn set_members(&self, set_key: &str) -> CacheResult<Vec<String>> {
        let set_key = set_key.to_string();
        self.execute_with_retry(move |mut conn| {
            let set_key = set_key.clone();
            Box::pin(async move { conn.smembers::<_, Vec<String>>(&set_key).await })
        })
        .await
    }

    async fn health_check(&self) -> CacheResult<bool> {
        let result = self
            .execute_with_retry(|mut conn| {
                Box::pin(async move { redis::cmd("PING").query_async::<_, String>(&mut conn).await })
            })
            .await;

        match result {
            Ok(response) => Ok(response == "PONG"),
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_settings() -> RedisSettings {
        RedisSettings {
            url: std::env::var("API_CACHE_TEST_REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            max_retries: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    #[ignore] // Requires a running Redis server
    async fn test_basic_operations() {
        let store = RedisStore::connect(local_settings()).await.unwrap();

        store
            .set_with_ttl("api_cache_test:key", b"value", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            store.get("api_cache_test:key").await.unwrap(),
            Some(b"value".to_vec())
        );
        assert_eq!(store.delete("api_cache_test:key").await.unwrap(), 1);
        assert_eq!(store.get("api_cache_test:key").await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore] // Requires a running Redis server
    async fn test_sets_and_scan() {
        let store = RedisStore::connect(local_settings()).await.unwrap();

        store.set_add("api_cache_test_tag:a", "k1").await.unwrap();
        store.set_add("api_cache_test_tag:a", "k1").await.unwrap();
        assert_eq!(
            store.set_members("api_cache_test_tag:a").await.unwrap(),
            vec!["k1".to_string()]
        );

        let keys = store.keys_matching("api_cache_test_tag:*").await.unwrap();
        assert!(keys.contains(&"api_cache_test_tag:a".to_string()));

        store.delete("api_cache_test_tag:a").await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires a running Redis server
    async fn test_health_check() {
        let store = RedisStore::connect(local_settings()).await.unwrap();
        assert!(store.health_check().await.unwrap());
    }
}
