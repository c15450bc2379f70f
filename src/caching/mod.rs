//! # Caching System Module
//!
//! Response caching for idempotent API handlers.
//!
//! ## Features
//! - Deterministic cache keys from endpoint, parameters and vary headers
//! - JSON payloads, gzip + base64 above a size threshold
//! - Tag-based invalidation
//! - Stale-while-revalidate with a bounded background refresh pool
//! - Single-flight collapsing of concurrent misses
//! - Per-key hit/miss and latency statistics
//! - Admin endpoints for cache management
//!
//! ## Architecture
//! 1. **Cache Manager**: the facade call sites use
//! 2. **Entry Store**: payload + metadata records in the backing store
//! 3. **Tag Index**: tag to key membership sets
//! 4. **Stores**: in-memory and Redis implementations of [`KvStore`]
//! 5. **Admin Interface**: management endpoints
//!
//! ## Usage Example
//! ```rust,no_run
//! use api_cache::caching::{CacheManager, CacheRequest, HandlerResponse};
//! use api_cache::core::config::CacheSettings;
//!
//! # async fn example() {
//! let cache = CacheManager::connect(CacheSettings::default()).await;
//! let options = cache.options_for("tagging").with_tags(["bookmark:42"]);
//!
//! let request = CacheRequest::get("ai.tags").with_param("bookmark_id", 42);
//! let outcome = cache
//!     .get_or_compute(&request, &options, || async {
//!         HandlerResponse::ok(vec!["rust".to_string(), "caching".to_string()])
//!     })
//!     .await;
//!
//! println!("{} -> {:?}", outcome.status.as_str(), outcome.response.body);
//! cache.invalidate_by_tags(&["bookmark:42".to_string()]).await;
//! # }
//! ```

pub mod admin;
pub mod cache_manager;
pub mod clock;
pub mod codec;
pub mod deduplication;
pub mod entry_store;
pub mod invalidation;
pub mod key_generator;
pub mod policy;
pub mod revalidation;
pub mod stats;
pub mod stores;

pub use admin::{CacheAdminRouter, CacheAdminState};
pub use cache_manager::{
    CacheManager, CacheOutcome, CacheRequest, CacheStatus, HandlerResponse, WarmUpTarget,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{EncodedPayload, PayloadCodec};
pub use deduplication::SingleFlight;
pub use entry_store::{CachedEntry, EntryMetadata, EntryStore, StoreSummary};
pub use invalidation::TagIndex;
pub use key_generator::{derive_key, vary_values, KeyGenerator};
pub use policy::{CacheOptions, PolicyRegistry};
pub use revalidation::{RevalidationFailure, RevalidationPool};
pub use stats::{CacheStats, KeyStatsSummary, StatsRecorder};
pub use stores::{InMemoryStore, KvStore, RedisStore};
