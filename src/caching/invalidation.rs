//! # Cache Invalidation Module
//!
//! Tag-based invalidation. Every tag maps to a set in the backing store
//! (`{tag_prefix}{tag}`) holding the cache keys written with that tag, so a
//! whole group of entries can be dropped without knowing their keys.

use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::entry_store::EntryStore;
use super::stores::KvStore;

/// Default namespace for tag sets
pub const DEFAULT_TAG_PREFIX: &str = "api_cache_tag:";

/// Tag to cache-key membership kept in the backing store
#[derive(Clone)]
pub struct TagIndex {
    store: Option<Arc<dyn KvStore>>,
    prefix: String,
}

impl TagIndex {
    pub fn new<S: Into<String>>(store: Option<Arc<dyn KvStore>>, prefix: S) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Store key of the set for `tag`
    pub fn set_key(&self, tag: &str) -> String {
        format!("{}{}", self.prefix, tag)
    }

    /// Glob matching every tag set
    pub fn pattern(&self) -> String {
        format!("{}*", self.prefix)
    }

    /// Record that `key` carries `tag`
    pub async fn add_member(&self, tag: &str, key: &str) {
        let Some(store) = &self.store else { return };

        if let Err(e) = store.set_add(&self.set_key(tag), key).await {
            warn!("Failed to register {} under tag {}: {}", key, tag, e);
        }
    }

    pub async fn remove_member(&self, tag: &str, key: &str) {
        let Some(store) = &self.store else { return };

        if let Err(e) = store.set_remove(&self.set_key(tag), key).await {
            warn!("Failed to unregister {} from tag {}: {}", key, tag, e);
        }
    }

    /// Keys currently registered under `tag`, sorted
    pub async fn members_of(&self, tag: &str) -> Vec<String> {
        let Some(store) = &self.store else {
            return Vec::new();
        };

        match store.set_members(&self.set_key(tag)).await {
            Ok(mut members) => {
                members.sort();
                members
            }
            Err(e) => {
                warn!("Failed to read members of tag {}: {}", tag, e);
                Vec::new()
            }
        }
    }

    /// Delete every entry registered under any of `tags`, then the tag sets.
    ///
    /// Returns the number of distinct entries removed. A key listed under
    /// several of the tags is counted once. Keys that fail to delete are
    /// logged, left out of the count and kept in their tag sets so a later
    /// invalidation can still reach them.
    pub async fn invalidate(&self, tags: &[String], entries: &EntryStore) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };

        let mut listed = Vec::with_capacity(tags.len());
        for tag in tags {
            match store.set_members(&self.set_key(tag)).await {
                Ok(members) => listed.push((tag, members)),
                Err(e) => warn!("Failed to read members of tag {}, skipping it: {}", tag, e),
            }
        }

        let keys: BTreeSet<&String> = listed.iter().flat_map(|(_, members)| members).collect();
        let outcomes = join_all(keys.iter().map(|key| async move {
            let outcome = entries.try_delete(key).await;
            if let Err(e) = &outcome {
                warn!("Failed to delete tagged entry {}: {}", key, e);
            }
            (*key, outcome)
        }))
        .await;

        let failed: BTreeSet<&String> = outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_err())
            .map(|(key, _)| *key)
            .collect();
        let removed = outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, Ok(true)))
            .count();

        for (tag, members) in &listed {
            let survivors = members.iter().filter(|key| failed.contains(key)).count();
            if survivors == 0 {
                if let Err(e) = store.delete(&self.set_key(tag)).await {
                    warn!("Failed to drop tag set {}: {}", tag, e);
                }
                continue;
            }

            warn!(
                "Keeping {} undeleted entries registered under tag {}",
                survivors, tag
            );
            for key in members.iter().filter(|key| !failed.contains(key)) {
                self.remove_member(tag, key).await;
            }
        }

        if removed > 0 {
            info!("Invalidated {} cache entries for tags {:?}", removed, tags);
        } else {
            debug!("No cache entries found for tags {:?}", tags);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::clock::ManualClock;
    use crate::caching::policy::CacheOptions;
    use crate::caching::stores::InMemoryStore;
    use crate::core::config::CacheSettings;
    use crate::core::error::{CacheError, CacheResult};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::collections::{HashMap, HashSet};
    use std::time::Duration;

    /// In-memory store whose next delete of each listed key fails
    struct FlakyStore {
        inner: InMemoryStore,
        failing_deletes: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl KvStore for FlakyStore {
        async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
            self.inner.get(key).await
        }

        async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
            self.inner.set_with_ttl(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> CacheResult<u64> {
            if self.failing_deletes.lock().remove(key) {
                return Err(CacheError::store(format!("delete of {} refused", key)));
            }
            self.inner.delete(key).await
        }

        async fn keys_matching(&self, pattern: &str) -> CacheResult<Vec<String>> {
            self.inner.keys_matching(pattern).await
        }

        async fn set_add(&self, set_key: &str, member: &str) -> CacheResult<()> {
            self.inner.set_add(set_key, member).await
        }

        async fn set_remove(&self, set_key: &str, member: &str) -> CacheResult<()> {
            self.inner.set_remove(set_key, member).await
        }

        async fn set_members(&self, set_key: &str) -> CacheResult<Vec<String>> {
            self.inner.set_members(set_key).await
        }

        async fn health_check(&self) -> CacheResult<bool> {
            self.inner.health_check().await
        }
    }

    fn setup() -> (EntryStore, Arc<InMemoryStore>) {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let entries = EntryStore::with_clock(Some(store.clone()), &CacheSettings::default(), clock);
        (entries, store)
    }

    async fn put_tagged(entries: &EntryStore, key: &str, tags: &[&str]) {
        let options = CacheOptions::new(Duration::from_secs(300)).with_tags(tags.iter().copied());
        assert!(entries.put(key, &json!(key), 200, &options, &HashMap::new()).await);
    }

    #[tokio::test]
    async fn test_invalidate_counts_distinct_keys() {
        let (entries, _store) = setup();
        put_tagged(&entries, "api_cache:k1", &["bookmarks", "user:1"]).await;
        put_tagged(&entries, "api_cache:k2", &["bookmarks"]).await;
        put_tagged(&entries, "api_cache:k3", &["media"]).await;

        let tags = vec!["bookmarks".to_string(), "user:1".to_string()];
        assert_eq!(entries.tags().invalidate(&tags, &entries).await, 2);

        assert!(entries.get::<Value>("api_cache:k1").await.is_none());
        assert!(entries.get::<Value>("api_cache:k2").await.is_none());
        assert!(entries.get::<Value>("api_cache:k3").await.is_some());
        assert!(entries.tags().members_of("bookmarks").await.is_empty());
        assert!(entries.tags().members_of("user:1").await.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_unknown_tag() {
        let (entries, _store) = setup();
        put_tagged(&entries, "api_cache:k1", &["bookmarks"]).await;

        assert_eq!(entries.tags().invalidate(&["nope".to_string()], &entries).await, 0);
        assert!(entries.get::<Value>("api_cache:k1").await.is_some());
    }

    #[tokio::test]
    async fn test_invalidate_clears_other_tag_memberships() {
        let (entries, _store) = setup();
        put_tagged(&entries, "api_cache:k1", &["a", "b"]).await;

        assert_eq!(entries.tags().invalidate(&["a".to_string()], &entries).await, 1);
        assert!(entries.tags().members_of("b").await.is_empty());
    }

    #[tokio::test]
    async fn test_expired_members_are_not_counted() {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let entries =
            EntryStore::with_clock(Some(store.clone()), &CacheSettings::default(), clock.clone());

        let short = CacheOptions::new(Duration::from_secs(5)).with_tags(["feed"]);
        entries.put("api_cache:old", &json!(1), 200, &short, &HashMap::new()).await;
        clock.advance(Duration::from_secs(600));

        assert_eq!(entries.tags().invalidate(&["feed".to_string()], &entries).await, 0);
    }

    #[tokio::test]
    async fn test_failed_delete_stays_reachable_by_tag() {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(FlakyStore {
            inner: InMemoryStore::with_clock(clock.clone()),
            failing_deletes: Mutex::new(HashSet::from(["api_cache:one".to_string()])),
        });
        let entries = EntryStore::with_clock(Some(store.clone()), &CacheSettings::default(), clock);
        put_tagged(&entries, "api_cache:one", &["a"]).await;
        put_tagged(&entries, "api_cache:two", &["a", "b"]).await;

        let tags = vec!["a".to_string()];
        assert_eq!(entries.tags().invalidate(&tags, &entries).await, 1);
        assert!(entries.get::<Value>("api_cache:one").await.is_some());
        assert!(entries.get::<Value>("api_cache:two").await.is_none());
        assert_eq!(entries.tags().members_of("a").await, vec!["api_cache:one".to_string()]);
        assert!(entries.tags().members_of("b").await.is_empty());

        assert_eq!(entries.tags().invalidate(&tags, &entries).await, 1);
        assert!(entries.get::<Value>("api_cache:one").await.is_none());
        assert!(entries.tags().members_of("a").await.is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_is_absorbed() {
        let (entries, store) = setup();
        put_tagged(&entries, "api_cache:k1", &["bookmarks"]).await;
        store.set_available(false);

        assert_eq!(entries.tags().invalidate(&["bookmarks".to_string()], &entries).await, 0);
        assert!(entries.tags().members_of("bookmarks").await.is_empty());

        store.set_available(true);
        assert_eq!(entries.tags().members_of("bookmarks").await, vec!["api_cache:k1".to_string()]);
    }
}
