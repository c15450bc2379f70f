//! # Cache Admin Interface
//!
//! This module provides admin endpoints for cache management and monitoring.

use super::entry_store::EntryMetadata;
use super::policy::CacheOptions;
use super::stats::CacheStats;
use super::CacheManager;
use crate::core::error::{CacheError, CacheResult};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Cache admin state
#[derive(Clone)]
pub struct CacheAdminState {
    pub cache_manager: CacheManager,
}

/// Cache admin router
pub struct CacheAdminRouter;

impl CacheAdminRouter {
    /// Create cache admin router
    pub fn create_router(state: CacheAdminState) -> Router {
        Router::new()
            .route("/cache/stats", get(get_cache_stats))
            .route("/cache/stats/reset", post(reset_cache_stats))
            .route("/cache/health", get(get_cache_health))
            .route("/cache/config", get(get_cache_config))
            .route("/cache/profiles", get(get_cache_profiles))
            .route("/cache/clear", post(clear_cache))
            .route("/cache/keys", get(list_cache_keys))
            .route("/cache/keys/:key", get(get_cache_key))
            .route("/cache/keys/:key", delete(delete_cache_key))
            .route("/cache/invalidate/tags", post(invalidate_cache_by_tags))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Cache statistics response
#[derive(Debug, Serialize)]
pub struct CacheStatsResponse {
    pub stats: CacheStats,
    pub health: bool,
    pub timestamp: DateTime<Utc>,
}

/// Cache health response
#[derive(Debug, Serialize, Deserialize)]
pub struct CacheHealthResponse {
    pub healthy: bool,
    pub store_attached: bool,
    pub single_flight: bool,
    pub timestamp: DateTime<Utc>,
}

/// Cache key response
#[derive(Debug, Serialize, Deserialize)]
pub struct CacheKeyResponse {
    pub key: String,
    pub exists: bool,
    pub metadata: Option<EntryMetadata>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CacheKeysResponse {
    pub keys: Vec<String>,
    pub count: usize,
    pub timestamp: DateTime<Utc>,
}

/// Tag invalidation request
#[derive(Debug, Serialize, Deserialize)]
pub struct TagInvalidationRequest {
    pub tags: Vec<String>,
}

/// Cache invalidation response
#[derive(Debug, Serialize, Deserialize)]
pub struct CacheInvalidationResponse {
    pub success: bool,
    pub message: String,
    pub invalidated_count: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl CacheInvalidationResponse {
    fn done<S: Into<String>>(message: S, count: Option<u64>) -> Self {
        Self {
            success: true,
            message: message.into(),
            invalidated_count: count,
            timestamp: Utc::now(),
        }
    }
}

/// Get cache statistics
pub async fn get_cache_stats(State(state): State<CacheAdminState>) -> Json<CacheStatsResponse> {
    let stats = state.cache_manager.get_stats().await;
    let health = state.cache_manager.health_check().await;

    info!(
        "Cache stats requested - entries: {}, hit_rate: {:.2}%",
        stats.item_count,
        stats.hit_rate * 100.0
    );

    Json(CacheStatsResponse {
        stats,
        health,
        timestamp: Utc::now(),
    })
}

/// Reset hit/miss counters and latency samples
pub async fn reset_cache_stats(
    State(state): State<CacheAdminState>,
) -> Json<CacheInvalidationResponse> {
    state.cache_manager.reset_stats();
    info!("Cache stats reset via admin API");
    Json(CacheInvalidationResponse::done("Cache statistics reset", None))
}

/// Get cache health status
pub async fn get_cache_health(
    State(state): State<CacheAdminState>,
) -> (StatusCode, Json<CacheHealthResponse>) {
    let manager = &state.cache_manager;
    let healthy = manager.health_check().await;

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(CacheHealthResponse {
            healthy,
            store_attached: manager.entries().is_attached(),
            single_flight: manager.settings().single_flight,
            timestamp: Utc::now(),
        }),
    )
}

/// Get cache configuration
pub async fn get_cache_config(
    State(state): State<CacheAdminState>,
) -> CacheResult<Json<serde_json::Value>> {
    let mut config = serde_json::to_value(state.cache_manager.settings())?;

    // Credentials may be embedded in the Redis URL
    if let Some(url) = config.pointer_mut("/redis/url") {
        *url = serde_json::Value::String("<redacted>".to_string());
    }

    Ok(Json(config))
}

/// Effective per-operation profiles
pub async fn get_cache_profiles(
    State(state): State<CacheAdminState>,
) -> Json<BTreeMap<String, CacheOptions>> {
    let policies = state.cache_manager.policies();
    Json(
        policies
            .names()
            .into_iter()
            .map(|name| (name.to_string(), policies.lookup(name)))
            .collect(),
    )
}

/// Clear all cache entries
pub async fn clear_cache(State(state): State<CacheAdminState>) -> Json<CacheInvalidationResponse> {
    let cleared = state.cache_manager.clear_all().await;
    info!("Cache cleared via admin API");

    Json(CacheInvalidationResponse::done(
        format!("Cleared {} cache entries", cleared),
        Some(cleared),
    ))
}

pub async fn list_cache_keys(State(state): State<CacheAdminState>) -> Json<CacheKeysResponse> {
    let mut keys = state.cache_manager.entries().keys().await;
    keys.sort();

    Json(CacheKeysResponse {
        count: keys.len(),
        keys,
        timestamp: Utc::now(),
    })
}

/// Get the metadata of one entry.
///
/// Metadata outlives the payload by a grace period, so `exists` also
/// requires the payload itself.
pub async fn get_cache_key(
    State(state): State<CacheAdminState>,
    Path(key): Path<String>,
) -> Json<CacheKeyResponse> {
    let entries = state.cache_manager.entries();
    let (metadata, live) = tokio::join!(entries.metadata(&key), entries.contains(&key));

    Json(CacheKeyResponse {
        key,
        exists: live && metadata.is_some(),
        metadata,
        timestamp: Utc::now(),
    })
}

/// Delete one entry
pub async fn delete_cache_key(
    State(state): State<CacheAdminState>,
    Path(key): Path<String>,
) -> Json<CacheInvalidationResponse> {
    let removed = state.cache_manager.invalidate(&key).await;
    if removed {
        info!("Deleted cache key via admin API: {}", key);
    }

    Json(CacheInvalidationResponse::done(
        if removed {
            format!("Deleted cache key: {}", key)
        } else {
            format!("Cache key not found: {}", key)
        },
        Some(u64::from(removed)),
    ))
}

/// Invalidate cache by tags
pub async fn invalidate_cache_by_tags(
    State(state): State<CacheAdminState>,
    Json(request): Json<TagInvalidationRequest>,
) -> CacheResult<Json<CacheInvalidationResponse>> {
    if request.tags.is_empty() {
        return Err(CacheError::invalid_request("Tags are required"));
    }

    let invalidated = state.cache_manager.invalidate_by_tags(&request.tags).await;
    info!("Invalidated {} cache entries with tags: {:?}", invalidated, request.tags);

    Ok(Json(CacheInvalidationResponse::done(
        format!("Invalidated cache entries with tags: {:?}", request.tags),
        Some(invalidated as u64),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::stores::{InMemoryStore, KvStore};
    use crate::caching::{CacheRequest, HandlerResponse, ManualClock};
    use crate::core::config::CacheSettings;
    use axum_test::TestServer;
    use std::sync::Arc;
    use std::time::Duration;

    fn create_test_state() -> CacheAdminState {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        CacheAdminState {
            cache_manager: CacheManager::new(Some(store), CacheSettings::default()),
        }
    }

    async fn cache_entry(state: &CacheAdminState, endpoint: &str, tags: &[&str]) -> String {
        let options = CacheOptions::new(Duration::from_secs(60)).with_tags(tags.iter().copied());
        let body = endpoint.to_string();
        state
            .cache_manager
            .get_or_compute(&CacheRequest::get(endpoint), &options, move || {
                let body = body.clone();
                async move { HandlerResponse::ok(body) }
            })
            .await
            .key
            .unwrap()
    }

    #[tokio::test]
    async fn test_cache_stats_endpoint() {
        let state = create_test_state();
        cache_entry(&state, "bookmarks.list", &[]).await;
        let server = TestServer::new(CacheAdminRouter::create_router(state)).unwrap();

        let response = server.get("/cache/stats").await;
        assert_eq!(response.status_code(), StatusCode::OK);

        let body: serde_json::Value = response.json();
        assert_eq!(body["stats"]["misses"], 1);
        assert_eq!(body["stats"]["item_count"], 1);
        assert_eq!(body["health"], true);

        let response = server.post("/cache/stats/reset").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body: serde_json::Value = server.get("/cache/stats").await.json();
        assert_eq!(body["stats"]["misses"], 0);
    }

    #[tokio::test]
    async fn test_cache_health_endpoint() {
        let server = TestServer::new(CacheAdminRouter::create_router(create_test_state())).unwrap();

        let response = server.get("/cache/health").await;
        assert_eq!(response.status_code(), StatusCode::OK);

        let health: CacheHealthResponse = response.json();
        assert!(health.healthy);
        assert!(health.store_attached);
    }

    #[tokio::test]
    async fn test_health_without_store() {
        let state = CacheAdminState {
            cache_manager: CacheManager::new(None, CacheSettings::default()),
        };
        let server = TestServer::new(CacheAdminRouter::create_router(state)).unwrap();

        let response = server.get("/cache/health").await;
        assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        let health: CacheHealthResponse = response.json();
        assert!(!health.store_attached);
    }

    #[tokio::test]
    async fn test_cache_key_operations() {
        let state = create_test_state();
        let key = cache_entry(&state, "tags.list", &["tags"]).await;
        let server = TestServer::new(CacheAdminRouter::create_router(state)).unwrap();

        let listed: CacheKeysResponse = server.get("/cache/keys").await.json();
        assert_eq!(listed.keys, vec![key.clone()]);

        let found: CacheKeyResponse = server.get(&format!("/cache/keys/{}", key)).await.json();
        assert!(found.exists);
        assert_eq!(found.metadata.unwrap().tags, vec!["tags".to_string()]);

        let deleted: CacheInvalidationResponse =
            server.delete(&format!("/cache/keys/{}", key)).await.json();
        assert_eq!(deleted.invalidated_count, Some(1));

        let missing: CacheKeyResponse = server.get(&format!("/cache/keys/{}", key)).await.json();
        assert!(!missing.exists);
    }

    #[tokio::test]
    async fn test_expired_key_is_not_reported_as_existing() {
        let clock = Arc::new(ManualClock::new());
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let state = CacheAdminState {
            cache_manager: CacheManager::with_clock(
                Some(store),
                CacheSettings::default(),
                clock.clone(),
            ),
        };
        let key = cache_entry(&state, "media.list", &[]).await;
        let server = TestServer::new(CacheAdminRouter::create_router(state)).unwrap();

        // Past the payload TTL but inside the metadata grace period
        clock.advance(Duration::from_secs(90));

        let expired: CacheKeyResponse = server.get(&format!("/cache/keys/{}", key)).await.json();
        assert!(!expired.exists);
        assert!(expired.metadata.is_some());
    }

    #[tokio::test]
    async fn test_cache_clear_endpoint() {
        let state = create_test_state();
        cache_entry(&state, "media.list", &[]).await;
        cache_entry(&state, "goals.list", &[]).await;
        let server = TestServer::new(CacheAdminRouter::create_router(state.clone())).unwrap();

        let response = server.post("/cache/clear").await;
        assert_eq!(response.status_code(), StatusCode::OK);

        let cleared: CacheInvalidationResponse = response.json();
        assert!(cleared.success);
        assert_eq!(cleared.invalidated_count, Some(2));
        assert_eq!(state.cache_manager.get_stats().await.item_count, 0);
    }

    #[tokio::test]
    async fn test_invalidate_by_tags_endpoint() {
        let state = create_test_state();
        cache_entry(&state, "bookmarks.list", &["bookmarks"]).await;
        cache_entry(&state, "bookmarks.recent", &["bookmarks"]).await;
        cache_entry(&state, "media.list", &["media"]).await;
        let server = TestServer::new(CacheAdminRouter::create_router(state)).unwrap();

        let response = server
            .post("/cache/invalidate/tags")
            .json(&TagInvalidationRequest {
                tags: vec!["bookmarks".to_string()],
            })
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body: CacheInvalidationResponse = response.json();
        assert_eq!(body.invalidated_count, Some(2));

        let response = server
            .post("/cache/invalidate/tags")
            .json(&TagInvalidationRequest { tags: Vec::new() })
            .await;
        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_config_redacts_redis_url() {
        let mut settings = CacheSettings::default();
        settings.redis = Some(crate::core::config::RedisSettings {
            url: "redis://:secret@cache:6379".to_string(),
            ..Default::default()
        });
        let state = CacheAdminState {
            cache_manager: CacheManager::new(None, settings),
        };
        let server = TestServer::new(CacheAdminRouter::create_router(state)).unwrap();

        let config: serde_json::Value = server.get("/cache/config").await.json();
        assert_eq!(config["redis"]["url"], "<redacted>");
        assert_eq!(config["key_prefix"], "api_cache:");

        let profiles: serde_json::Value = server.get("/cache/profiles").await.json();
        assert!(profiles.get("categorization").is_some());
    }
}
