//! # Entry Store
//!
//! Persists cached payloads together with their metadata in the backing
//! store. Each entry is up to three keys:
//!
//! - `{key}` holds the encoded payload and expires after the entry's TTL
//! - `{key}:meta` holds [`EntryMetadata`] as JSON and outlives the payload by
//!   a grace period. It is written only by `put`.
//! - `{key}:access` holds the hit count and last access time. Reads update
//!   it and nothing else, so a hit racing a `put` can only lose a count.
//!
//! Every store failure is logged and degrades to a miss or a no-op. Callers
//! never see a backing-store error from this layer.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::clock::{elapsed_between, Clock, SystemClock};
use super::codec::PayloadCodec;
use super::invalidation::TagIndex;
use super::policy::CacheOptions;
use super::stores::KvStore;
use crate::core::config::CacheSettings;
use crate::core::error::CacheResult;

/// Suffix appended to a cache key to address its metadata
pub const META_SUFFIX: &str = ":meta";

/// Suffix addressing the access counters of a cache key
pub const ACCESS_SUFFIX: &str = ":access";

/// Metadata key for a cache key
pub fn metadata_key(key: &str) -> String {
    format!("{}{}", key, META_SUFFIX)
}

pub fn access_key(key: &str) -> String {
    format!("{}{}", key, ACCESS_SUFFIX)
}

/// Whole-second lifetime recorded for `ttl`; sub-second parts round up
fn whole_seconds(ttl: Duration) -> Duration {
    Duration::from_secs(ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0))
}

/// Bookkeeping stored next to every payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub hit_count: u64,
    /// Size of the encoded payload
    pub size_bytes: usize,
    pub compressed: bool,
    /// Status the handler answered with when the entry was produced
    pub status: u16,
    pub tags: Vec<String>,
    pub vary: BTreeMap<String, String>,
}

impl EntryMetadata {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    /// Time since the entry was written
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        elapsed_between(self.created_at, now)
    }

    /// Time until the payload expires, zero once it has
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.ttl().saturating_sub(self.age(now))
    }
}

/// Advisory counters updated on every hit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct EntryAccess {
    hit_count: u64,
    last_accessed: DateTime<Utc>,
}

/// A decoded payload with its metadata
#[derive(Debug, Clone)]
pub struct CachedEntry<T> {
    pub value: T,
    pub metadata: EntryMetadata,
}

/// Aggregate size of the stored entries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreSummary {
    pub item_count: u64,
    pub total_size_bytes: u64,
}

/// Reads and writes cache entries in the backing store
#[derive(Clone)]
pub struct EntryStore {
    store: Option<Arc<dyn KvStore>>,
    codec: PayloadCodec,
    clock: Arc<dyn Clock>,
    tags: TagIndex,
    key_prefix: String,
    max_entry_bytes: usize,
    metadata_grace: Duration,
}

impl std::fmt::Debug for EntryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryStore")
            .field("attached", &self.store.is_some())
            .field("key_prefix", &self.key_prefix)
            .field("max_entry_bytes", &self.max_entry_bytes)
            .finish()
    }
}

impl EntryStore {
    /// Entry store over `store`; `None` turns every operation into a no-op
    pub fn new(store: Option<Arc<dyn KvStore>>, settings: &CacheSettings) -> Self {
        Self::with_clock(store, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Option<Arc<dyn KvStore>>,
        settings: &CacheSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tags: TagIndex::new(store.clone(), settings.tag_prefix.clone()),
            store,
            codec: PayloadCodec::new(settings.compression_threshold),
            clock,
            key_prefix: settings.key_prefix.clone(),
            max_entry_bytes: settings.max_entry_bytes,
            metadata_grace: settings.metadata_grace,
        }
    }

    /// Whether a backing store is attached
    pub fn is_attached(&self) -> bool {
        self.store.is_some()
    }

    pub fn tags(&self) -> &TagIndex {
        &self.tags
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Store a payload under `key`.
    ///
    /// Returns whether the entry was written. Nothing is written when no store
    /// is attached, the TTL is zero, the payload cannot be encoded or its
    /// encoded size exceeds the configured ceiling.
    pub async fn put<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        status: u16,
        options: &CacheOptions,
        vary: &HashMap<String, String>,
    ) -> bool {
        let Some(store) = &self.store else {
            return false;
        };

        if options.ttl.is_zero() {
            debug!("Skipping cache write for {} with zero TTL", key);
            return false;
        }

        let encoded = match self.codec.encode_with(value, options.compression) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Failed to encode payload for {}: {}", key, e);
                return false;
            }
        };

        if encoded.len() > self.max_entry_bytes {
            warn!(
                "Payload for {} is {} bytes, above the {} byte limit; not caching",
                key,
                encoded.len(),
                self.max_entry_bytes
            );
            return false;
        }

        let ttl = whole_seconds(options.ttl);
        let now = self.clock.now();
        let metadata = EntryMetadata {
            key: key.to_string(),
            created_at: now,
            last_accessed: now,
            ttl_seconds: ttl.as_secs(),
            hit_count: 0,
            size_bytes: encoded.len(),
            compressed: encoded.compressed,
            status,
            tags: options.tags.clone(),
            vary: vary.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };

        let written = async {
            store.set_with_ttl(key, encoded.data.as_bytes(), ttl).await?;
            self.write_metadata(store.as_ref(), &metadata, ttl).await?;
            // A replaced entry starts counting from zero
            store.delete(&access_key(key)).await.map(|_| ())
        }
        .await;

        if let Err(e) = written {
            warn!("Failed to write cache entry {}: {}", key, e);
            return false;
        }

        for tag in &metadata.tags {
            self.tags.add_member(tag, key).await;
        }

        debug!(
            "Cached {} ({} bytes, compressed: {}, ttl: {}s)",
            key, metadata.size_bytes, metadata.compressed, metadata.ttl_seconds
        );
        true
    }

    /// Fetch and decode the entry under `key`.
    ///
    /// Missing payload or metadata, a decode failure and a store failure all
    /// read as a miss. A hit bumps the entry's hit count.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<CachedEntry<T>> {
        let store = self.store.as_ref()?;

        match self.read(store.as_ref(), key).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Failed to read cache entry {}, treating as miss: {}", key, e);
                None
            }
        }
    }

    async fn read<T: DeserializeOwned>(
        &self,
        store: &dyn KvStore,
        key: &str,
    ) -> CacheResult<Option<CachedEntry<T>>> {
        let (meta_key, counters_key) = (metadata_key(key), access_key(key));
        let (payload, metadata, access) = tokio::join!(
            store.get(key),
            store.get(&meta_key),
            store.get(&counters_key)
        );

        let (Some(payload), Some(metadata)) = (payload?, metadata?) else {
            return Ok(None);
        };

        let mut metadata: EntryMetadata = serde_json::from_slice(&metadata)?;
        let payload = String::from_utf8(payload)?;
        let value = self.codec.decode(&payload, metadata.compressed)?;

        let previous = match access {
            Ok(raw) => Self::parse_access(key, raw),
            Err(e) => {
                warn!("Failed to read access counters for {}: {}", key, e);
                None
            }
        };

        let now = self.clock.now();
        let access = EntryAccess {
            hit_count: previous.map_or(0, |a| a.hit_count) + 1,
            last_accessed: now,
        };
        metadata.hit_count = access.hit_count;
        metadata.last_accessed = now;

        // Counters live as long as the metadata, never longer
        let lifetime = metadata.remaining(now) + self.metadata_grace;
        let written = async {
            let raw = serde_json::to_vec(&access)?;
            store.set_with_ttl(&counters_key, &raw, lifetime).await
        }
        .await;
        if let Err(e) = written {
            warn!("Failed to update access counters for {}: {}", key, e);
        }

        Ok(Some(CachedEntry { value, metadata }))
    }

    fn parse_access(key: &str, raw: Option<Vec<u8>>) -> Option<EntryAccess> {
        serde_json::from_slice(&raw?)
            .map_err(|e| warn!("Corrupt access counters for {}: {}", key, e))
            .ok()
    }

    /// Metadata of the entry under `key`, without counting a hit
    pub async fn metadata(&self, key: &str) -> Option<EntryMetadata> {
        let store = self.store.as_ref()?;
        let (meta_key, acc_key) = (metadata_key(key), access_key(key));
        let (metadata, access) = tokio::join!(
            store.get(&meta_key),
            store.get(&acc_key)
        );

        let mut metadata: EntryMetadata = match metadata {
            Ok(Some(raw)) => serde_json::from_slice(&raw)
                .map_err(|e| warn!("Corrupt metadata for {}: {}", key, e))
                .ok()?,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to read metadata for {}: {}", key, e);
                return None;
            }
        };

        if let Some(access) = access.ok().and_then(|raw| Self::parse_access(key, raw)) {
            metadata.hit_count = access.hit_count;
            metadata.last_accessed = access.last_accessed;
        }
        Some(metadata)
    }

    /// Whether a live payload is stored under `key`
    pub async fn contains(&self, key: &str) -> bool {
        let Some(store) = &self.store else {
            return false;
        };

        match store.get(key).await {
            Ok(payload) => payload.is_some(),
            Err(e) => {
                warn!("Failed to look up {}: {}", key, e);
                false
            }
        }
    }

    /// Remove the entry under `key` with its metadata and tag memberships.
    ///
    /// Returns whether anything was removed; a store failure reads as `false`.
    pub async fn delete(&self, key: &str) -> bool {
        match self.try_delete(key).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Failed to delete cache entry {}: {}", key, e);
                false
            }
        }
    }

    /// Like [`delete`](Self::delete), but a store failure is returned instead
    /// of folded into `false`. `Ok(false)` means there was nothing to remove.
    pub async fn try_delete(&self, key: &str) -> CacheResult<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };

        let tags = match store.get(&metadata_key(key)).await? {
            Some(raw) => serde_json::from_slice::<EntryMetadata>(&raw)
                .map(|metadata| metadata.tags)
                .unwrap_or_else(|e| {
                    warn!("Corrupt metadata for {}: {}", key, e);
                    Vec::new()
                }),
            None => Vec::new(),
        };

        let payload = store.delete(key).await?;
        let metadata = store.delete(&metadata_key(key)).await?;
        store.delete(&access_key(key)).await?;

        for tag in &tags {
            self.tags.remove_member(tag, key).await;
        }

        let removed = payload + metadata > 0;
        if removed {
            debug!("Deleted cache entry {}", key);
        }
        Ok(removed)
    }

    /// Every payload key currently stored
    pub async fn keys(&self) -> Vec<String> {
        let Some(store) = &self.store else {
            return Vec::new();
        };

        match store.keys_matching(&format!("{}*", self.key_prefix)).await {
            Ok(keys) => keys
                .into_iter()
                .filter(|key| self.is_payload_key(key))
                .collect(),
            Err(e) => {
                warn!("Failed to list cache keys: {}", e);
                Vec::new()
            }
        }
    }

    /// Remove every entry, metadata record and tag set in the cache's
    /// namespaces. Returns the number of entries removed.
    pub async fn clear(&self) -> u64 {
        let Some(store) = &self.store else {
            return 0;
        };

        let listed = async {
            let mut keys = store.keys_matching(&format!("{}*", self.key_prefix)).await?;
            keys.extend(store.keys_matching(&self.tags.pattern()).await?);
            CacheResult::Ok(keys)
        }
        .await;

        let keys = match listed {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Failed to list keys for clear: {}", e);
                return 0;
            }
        };

        let deletions = keys.iter().map(|key| async move {
            match store.delete(key).await {
                Ok(removed) => removed > 0 && self.is_payload_key(key),
                Err(e) => {
                    warn!("Failed to delete {} during clear: {}", key, e);
                    false
                }
            }
        });

        let cleared = join_all(deletions).await.into_iter().filter(|ok| *ok).count() as u64;
        debug!("Cleared {} cache entries", cleared);
        cleared
    }

    /// Item count and total encoded size of the stored entries
    pub async fn summary(&self) -> StoreSummary {
        let keys = self.keys().await;
        let sizes = join_all(keys.iter().map(|key| self.metadata(key))).await;

        StoreSummary {
            item_count: keys.len() as u64,
            total_size_bytes: sizes
                .into_iter()
                .flatten()
                .map(|metadata| metadata.size_bytes as u64)
                .sum(),
        }
    }

    /// Probe the backing store. `false` when no store is attached.
    pub async fn health_check(&self) -> bool {
        match &self.store {
            Some(store) => store.health_check().await.unwrap_or(false),
            None => false,
        }
    }

    fn is_payload_key(&self, key: &str) -> bool {
        key.starts_with(&self.key_prefix)
            && !key.ends_with(META_SUFFIX)
            && !key.ends_with(ACCESS_SUFFIX)
    }

    async fn write_metadata(
        &self,
        store: &dyn KvStore,
        metadata: &EntryMetadata,
        payload_lifetime: Duration,
    ) -> CacheResult<()> {
        let raw = serde_json::to_vec(metadata)?;
        store
            .set_with_ttl(
                &metadata_key(&metadata.key),
                &raw,
                payload_lifetime + self.metadata_grace,
            )
            .await
    }
}
