//! # Cache Manager
//!
//! The facade other code calls. [`CacheManager::get_or_compute`] wraps an
//! idempotent handler: eligible requests are answered from the entry store
//! when possible and the handler's successful results are stored for next
//! time. Stale hits are served immediately and refreshed in the background.
//!
//! Caching never changes what the caller sees beyond latency: when the store
//! is missing or failing, every request simply runs the handler.

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::deduplication::{Flight, SingleFlight};
use super::entry_store::EntryStore;
use super::key_generator::{vary_values, KeyGenerator};
use super::policy::{CacheOptions, PolicyRegistry};
use super::revalidation::{RevalidationFailure, RevalidationPool};
use super::stats::{CacheStats, StatsRecorder};
use super::stores::{InMemoryStore, KvStore, RedisStore};
use crate::core::config::CacheSettings;
use crate::core::error::CacheError;

/// The request attributes that decide eligibility and the cache key
#[derive(Debug, Clone)]
pub struct CacheRequest {
    pub method: Method,
    /// Logical endpoint identity, e.g. `bookmarks.list`
    pub endpoint: String,
    pub params: HashMap<String, Value>,
    pub headers: HeaderMap,
}

impl CacheRequest {
    pub fn new<S: Into<String>>(method: Method, endpoint: S) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            params: HashMap::new(),
            headers: HeaderMap::new(),
        }
    }

    /// A read request for `endpoint`
    pub fn get<S: Into<String>>(endpoint: S) -> Self {
        Self::new(Method::GET, endpoint)
    }

    pub fn with_param<K: Into<String>, V: Into<Value>>(mut self, name: K, value: V) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_params(mut self, params: HashMap<String, Value>) -> Self {
        self.params.extend(params);
        self
    }

    /// Add a header; names or values that are not valid HTTP are ignored
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => warn!("Ignoring invalid header {}", name),
        }
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Whether the method is a safe, idempotent read
    pub fn is_read(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }

    /// Whether the caller sent `Cache-Control: no-cache` or `no-store`
    pub fn opts_out(&self) -> bool {
        self.headers
            .get_all(header::CACHE_CONTROL)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(|directive| directive.trim().to_ascii_lowercase())
            .any(|directive| directive == "no-cache" || directive == "no-store")
    }
}

/// What a wrapped handler answers with
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerResponse<T> {
    pub status: StatusCode,
    pub body: T,
}

impl<T> HandlerResponse<T> {
    pub fn new(status: StatusCode, body: T) -> Self {
        Self { status, body }
    }

    /// A `200 OK` response
    pub fn ok(body: T) -> Self {
        Self::new(StatusCode::OK, body)
    }
}

/// How a request was answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    /// Served from a fresh entry
    Hit,
    /// Served from a stale entry; a refresh was requested
    Stale,
    /// Computed by the handler
    Miss,
    /// Not eligible for caching; computed by the handler
    Bypass,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Stale => "STALE",
            Self::Miss => "MISS",
            Self::Bypass => "BYPASS",
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit | Self::Stale)
    }
}

/// Result of [`CacheManager::get_or_compute`]
#[derive(Debug, Clone)]
pub struct CacheOutcome<T> {
    pub response: HandlerResponse<T>,
    pub status: CacheStatus,
    /// Derived cache key, absent for bypassed requests
    pub key: Option<String>,
}

impl<T> CacheOutcome<T> {
    fn bypass(response: HandlerResponse<T>) -> Self {
        Self {
            response,
            status: CacheStatus::Bypass,
            key: None,
        }
    }

    pub fn into_response(self) -> HandlerResponse<T> {
        self.response
    }
}

/// An endpoint and parameters to pre-populate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmUpTarget {
    pub endpoint: String,
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

impl WarmUpTarget {
    pub fn new<S: Into<String>>(endpoint: S, params: HashMap<String, Value>) -> Self {
        Self {
            endpoint: endpoint.into(),
            params,
        }
    }
}

struct Inner {
    settings: CacheSettings,
    keys: KeyGenerator,
    entries: EntryStore,
    stats: StatsRecorder,
    revalidation: RevalidationPool,
    single_flight: Option<SingleFlight>,
    policies: PolicyRegistry,
    cacheable_statuses: HashSet<u16>,
}

/// Cache facade; cheap to clone, clones share all state
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("entries", &self.inner.entries)
            .field("single_flight", &self.inner.single_flight.is_some())
            .finish()
    }
}

impl CacheManager {
    /// Create a manager over `store`; `None` runs every request uncached
    pub fn new(store: Option<Arc<dyn KvStore>>, settings: CacheSettings) -> Self {
        Self::with_clock(store, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Option<Arc<dyn KvStore>>,
        settings: CacheSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = if settings.enabled { store } else { None };

        let inner = Inner {
            keys: KeyGenerator::new(settings.key_prefix.clone()),
            entries: EntryStore::with_clock(store, &settings, clock),
            stats: StatsRecorder::new(settings.latency_window, settings.top_keys),
            revalidation: RevalidationPool::new(settings.revalidation_concurrency),
            single_flight: settings.single_flight.then(SingleFlight::new),
            policies: PolicyRegistry::with_overrides(&settings.profiles),
            cacheable_statuses: settings.cacheable_statuses.iter().copied().collect(),
            settings,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Build a manager from settings, connecting to Redis when configured.
    ///
    /// An unreachable Redis leaves the manager running without a store.
    pub async fn connect(settings: CacheSettings) -> Self {
        if !settings.enabled {
            info!("Caching disabled by configuration");
            return Self::new(None, settings);
        }

        let store: Option<Arc<dyn KvStore>> = match &settings.redis {
            Some(redis) => match RedisStore::connect(redis.clone()).await {
                Ok(store) => Some(Arc::new(store) as Arc<dyn KvStore>),
                Err(e) => {
                    warn!("Redis unavailable, running without a cache store: {}", e);
                    None
                }
            },
            None => {
                info!("No Redis configured, using the in-memory cache store");
                Some(Arc::new(InMemoryStore::new()) as Arc<dyn KvStore>)
            }
        };

        Self::new(store, settings)
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.inner.settings
    }

    pub fn entries(&self) -> &EntryStore {
        &self.inner.entries
    }

    pub fn key_generator(&self) -> &KeyGenerator {
        &self.inner.keys
    }

    pub fn policies(&self) -> &PolicyRegistry {
        &self.inner.policies
    }

    /// Default options for a named operation
    pub fn options_for(&self, operation: &str) -> CacheOptions {
        self.inner.policies.lookup(operation)
    }

    /// Whether a handler status may be stored
    pub fn is_cacheable_status(&self, status: StatusCode) -> bool {
        self.inner.cacheable_statuses.contains(&status.as_u16())
    }

    /// Key `request` would be cached under with `options`
    pub fn key_for(&self, request: &CacheRequest, options: &CacheOptions) -> Option<String> {
        let vary = vary_values(&request.headers, &options.vary);
        self.inner
            .keys
            .try_derive(&request.endpoint, &request.params, &vary)
            .map_err(|e| warn!("Cannot derive cache key: {}", e))
            .ok()
    }

    fn bypass_reason(&self, request: &CacheRequest, options: &CacheOptions) -> Option<&'static str> {
        if !self.inner.entries.is_attached() {
            Some("no cache store")
        } else if options.skip_cache {
            Some("skip_cache set")
        } else if !request.is_read() {
            Some("method is not a read")
        } else if request.opts_out() {
            Some("Cache-Control opt-out")
        } else {
            None
        }
    }

    /// Answer `request` from the cache, or run `handler` and cache its result.
    ///
    /// Only results whose status is cacheable are stored. A stale hit is
    /// returned at once and a single background refresh re-runs `handler`.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        request: &CacheRequest,
        options: &CacheOptions,
        handler: F,
    ) -> CacheOutcome<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResponse<T>> + Send + 'static,
    {
        if let Some(reason) = self.bypass_reason(request, options) {
            debug!("Bypassing cache for {}: {}", request.endpoint, reason);
            return CacheOutcome::bypass(handler().await);
        }

        let vary = vary_values(&request.headers, &options.vary);
        let key = match self
            .inner
            .keys
            .try_derive(&request.endpoint, &request.params, &vary)
        {
            Ok(key) => key,
            Err(e) => {
                warn!("Bypassing cache: {}", e);
                return CacheOutcome::bypass(handler().await);
            }
        };

        let started = Instant::now();

        if let Some(entry) = self.inner.entries.get::<T>(&key).await {
            let age = entry.metadata.age(self.inner.entries.clock().now());
            let stale = options.is_stale(age);
            self.inner.stats.record_hit(&key, started.elapsed());

            if stale {
                debug!("Serving stale entry {} (age {:?})", key, age);
                self.schedule_revalidation(&key, options, vary, handler);
            }

            let status = StatusCode::from_u16(entry.metadata.status).unwrap_or(StatusCode::OK);
            return CacheOutcome {
                response: HandlerResponse::new(status, entry.value),
                status: if stale {
                    CacheStatus::Stale
                } else {
                    CacheStatus::Hit
                },
                key: Some(key),
            };
        }

        let response = match &self.inner.single_flight {
            Some(flights) => match flights.join(&key) {
                Flight::Leader(leader) => {
                    let response = self.compute_and_store(&key, options, &vary, &handler).await;
                    leader.complete(response.clone());
                    response
                }
                Flight::Follower(follower) => match follower.wait::<HandlerResponse<T>>().await {
                    Some(response) => response,
                    None => self.compute_and_store(&key, options, &vary, &handler).await,
                },
            },
            None => self.compute_and_store(&key, options, &vary, &handler).await,
        };

        self.inner.stats.record_miss(&key, started.elapsed());

        CacheOutcome {
            response,
            status: CacheStatus::Miss,
            key: Some(key),
        }
    }

    async fn compute_and_store<T, F, Fut>(
        &self,
        key: &str,
        options: &CacheOptions,
        vary: &HashMap<String, String>,
        handler: &F,
    ) -> HandlerResponse<T>
    where
        T: Serialize,
        F: Fn() -> Fut,
        Fut: Future<Output = HandlerResponse<T>>,
    {
        let response = handler().await;
        self.store_response(key, options, vary, &response).await;
        response
    }

    /// Store `response` if its status is cacheable; returns whether it was written
    async fn store_response<T: Serialize>(
        &self,
        key: &str,
        options: &CacheOptions,
        vary: &HashMap<String, String>,
        response: &HandlerResponse<T>,
    ) -> bool {
        if !self.is_cacheable_status(response.status) {
            debug!("Not caching {} with status {}", key, response.status);
            return false;
        }

        self.inner
            .entries
            .put(key, &response.body, response.status.as_u16(), options, vary)
            .await
    }

    fn schedule_revalidation<T, F, Fut>(
        &self,
        key: &str,
        options: &CacheOptions,
        vary: HashMap<String, String>,
        handler: F,
    ) where
        T: Serialize + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResponse<T>> + Send + 'static,
    {
        let manager = self.clone();
        let task_key = key.to_string();
        let options = options.clone();

        let submitted = self.inner.revalidation.submit(key, async move {
            let response = handler().await;

            if !manager.is_cacheable_status(response.status) {
                return Err(CacheError::revalidation(format!(
                    "handler answered {}",
                    response.status
                )));
            }

            if manager
                .store_response(&task_key, &options, &vary, &response)
                .await
            {
                Ok(())
            } else {
                Err(CacheError::revalidation("refreshed value was not stored"))
            }
        });

        if !submitted {
            debug!("Refresh of {} not scheduled", key);
        }
    }

    /// Drop every entry carrying any of `tags`; returns the distinct entries removed
    pub async fn invalidate_by_tags(&self, tags: &[String]) -> usize {
        self.inner
            .entries
            .tags()
            .invalidate(tags, &self.inner.entries)
            .await
    }

    /// Drop one entry by key
    pub async fn invalidate(&self, key: &str) -> bool {
        self.inner.entries.delete(key).await
    }

    /// Drop the entry `request` would be served from
    pub async fn invalidate_request(&self, request: &CacheRequest, options: &CacheOptions) -> bool {
        match self.key_for(request, options) {
            Some(key) => self.invalidate(&key).await,
            None => false,
        }
    }

    /// Drop every entry and tag set; returns the number of entries removed
    pub async fn clear_all(&self) -> u64 {
        let cleared = self.inner.entries.clear().await;
        info!("Cleared {} cache entries", cleared);
        cleared
    }

    pub async fn get_stats(&self) -> CacheStats {
        let summary = self.inner.entries.summary().await;
        self.inner
            .stats
            .snapshot(summary, self.inner.entries.clock().now())
    }

    pub fn reset_stats(&self) {
        self.inner.stats.reset();
    }

    /// Whether the backing store answers; false when none is attached
    pub async fn health_check(&self) -> bool {
        self.inner.entries.health_check().await
    }

    /// Pre-populate the cache for `targets` in the background.
    ///
    /// Returns immediately. The handle resolves to the number of targets that
    /// ended up cached; awaiting it is optional.
    pub fn warm_up<T, F, Fut>(
        &self,
        targets: Vec<WarmUpTarget>,
        options: CacheOptions,
        handler: F,
    ) -> JoinHandle<usize>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        F: Fn(WarmUpTarget) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResponse<T>> + Send + 'static,
    {
        let manager = self.clone();
        let handler = Arc::new(handler);

        tokio::spawn(async move {
            let mut warmed = 0;

            for target in targets {
                let request =
                    CacheRequest::get(target.endpoint.clone()).with_params(target.params.clone());
                let handler = Arc::clone(&handler);

                let outcome = manager
                    .get_or_compute(&request, &options, move || (*handler)(target.clone()))
                    .await;

                let cached = outcome.status.is_hit()
                    || (outcome.status == CacheStatus::Miss
                        && manager.is_cacheable_status(outcome.response.status));
                if cached {
                    warmed += 1;
                } else {
                    debug!(
                        "Warm-up of {} not cached ({})",
                        request.endpoint,
                        outcome.status.as_str()
                    );
                }
            }

            info!("Cache warm-up finished: {} entries ready", warmed);
            warmed
        })
    }

    /// Failures of background refreshes from now on
    pub fn subscribe_revalidation_failures(&self) -> broadcast::Receiver<RevalidationFailure> {
        self.inner.revalidation.subscribe()
    }

    /// Wait for every background refresh scheduled so far
    pub async fn wait_for_background(&self) {
        self.inner.revalidation.wait_idle().await;
    }
}
