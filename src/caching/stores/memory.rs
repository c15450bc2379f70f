//! # In-Memory Store
//!
//! In-process implementation of [`KvStore`]. Expiry is evaluated lazily
//! against the injected [`Clock`], so tests can move time forward without
//! sleeping. It can also be switched offline to exercise the degraded paths.

use super::{glob_matches, KvStore};
use crate::caching::clock::{Clock, SystemClock};
use crate::core::error::{CacheError, CacheResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredValue {
    data: Vec<u8>,
    expires_at: DateTime<Utc>,
}

pub struct InMemoryStore {
    values: DashMap<String, StoredValue>,
    sets: DashMap<String, HashSet<String>>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Store driven by wall-clock time
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            values: DashMap::new(),
            sets: DashMap::new(),
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store going away (`false`) or coming back (`true`)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live plain values, ignoring sets
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.values.iter().filter(|v| v.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining lifetime of a plain value
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        self.values
            .get(key)
            .and_then(|v| (v.expires_at - now).to_std().ok())
            .filter(|ttl| !ttl.is_zero())
    }

    fn ensure_available(&self) -> CacheResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Unavailable)
        }
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.ensure_available()?;

        let now = self.clock.now();
        let expired = match self.values.get(key) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.data.clone())),
            Some(_) => true,
            None => false,
        };

        if expired {
            self.values.remove(key);
            debug!("Dropped expired in-memory key: {}", key);
        }
        Ok(None)
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        self.ensure_available()?;

        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| CacheError::store(format!("TTL out of range: {}", e)))?;
        self.values.insert(
            key.to_string(),
            StoredValue {
                data: value.to_vec(),
                expires_at: self.clock.now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<u64> {
        self.ensure_available()?;

        let now = self.clock.now();
        let mut removed = 0;
        if let Some((_, value)) = self.values.remove(key) {
            if value.expires_at > now {
                removed += 1;
            }
        }
        if self.sets.remove(key).is_some() {
            removed += 1;
        }
        Ok(removed)
    }

    async fn keys_matching(&self, pattern: &str) -> CacheResult<Vec<String>> {
        self.ensure_available()?;

        let now = self.clock.now();
        let mut keys: Vec<String> = self
            .values
            .iter()
            .filter(|entry| entry.expires_at > now && glob_matches(pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.extend(
            self.sets
                .iter()
                .filter(|entry| glob_matches(pattern, entry.key()))
                .map(|entry| entry.key().clone()),
        );
        Ok(keys)
    }

    async fn set_add(&self, set_key: &str, member: &str) -> CacheResult<()> {
        self.ensure_available()?;

        self.sets
            .entry(set_key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, set_key: &str, member: &str) -> CacheResult<()> {
        self.ensure_available()?;

        if let Some(mut members) = self.sets.get_mut(set_key) {
            members.remove(member);
        }
        self.sets.remove_if(set_key, |_, members| members.is_empty());
        Ok(())
    }

    async fn set_members(&self, set_key: &str) -> CacheResult<Vec<String>> {
        self.ensure_available()?;

        Ok(self
            .sets
            .get(set_key)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn health_check(&self) -> CacheResult<bool> {
        Ok(self.available.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::clock::ManualClock;

    fn store_with_clock() -> (InMemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (InMemoryStore::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_basic_operations() {
        let (store, _clock) = store_with_clock();

        store.set_with_ttl("key", b"value", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("key").await.unwrap(), Some(b"value".to_vec()));

        assert_eq!(store.delete("key").await.unwrap(), 1);
        assert_eq!(store.get("key").await.unwrap(), None);
        assert_eq!(store.delete("key").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ttl_expiration() {
        let (store, clock) = store_with_clock();

        store.set_with_ttl("expire", b"soon", Duration::from_secs(1)).await.unwrap();
        assert!(store.get("expire").await.unwrap().is_some());
        assert_eq!(store.ttl_of("expire"), Some(Duration::from_secs(1)));

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.get("expire").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_sets_and_patterns() {
        let (store, _clock) = store_with_clock();

        store.set_add("tags:a", "k1").await.unwrap();
        store.set_add("tags:a", "k1").await.unwrap();
        store.set_add("tags:a", "k2").await.unwrap();
        store.set_with_ttl("cache:k1", b"1", Duration::from_secs(60)).await.unwrap();

        let mut members = store.set_members("tags:a").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["k1".to_string(), "k2".to_string()]);
        assert!(store.set_members("tags:none").await.unwrap().is_empty());

        assert_eq!(store.keys_matching("tags:*").await.unwrap(), vec!["tags:a".to_string()]);
        assert_eq!(store.keys_matching("cache:*").await.unwrap(), vec!["cache:k1".to_string()]);

        store.set_remove("tags:a", "k2").await.unwrap();
        assert_eq!(store.set_members("tags:a").await.unwrap(), vec!["k1".to_string()]);

        assert_eq!(store.delete("tags:a").await.unwrap(), 1);
        assert!(store.set_members("tags:a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let (store, _clock) = store_with_clock();
        store.set_available(false);

        assert!(matches!(store.get("key").await, Err(CacheError::Unavailable)));
        assert!(!store.health_check().await.unwrap());

        store.set_available(true);
        assert!(store.health_check().await.unwrap());
    }
}
