//! # API Cache - Admin Server
//!
//! Runs the cache engine with its admin API, for operating a shared Redis
//! cache (inspecting stats, clearing, invalidating tags) out of band.
//!
//! Usage: `api-cache [config.yaml|config.json]`. Without a path the defaults
//! are used; `API_CACHE_*` environment variables apply in both cases.

use anyhow::Context;
use std::path::Path;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

use api_cache::caching::{CacheAdminRouter, CacheAdminState, CacheManager};
use api_cache::core::config::CacheSettings;
use api_cache::observability::init_logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = load_settings(std::env::args().nth(1)).await?;
    init_logging(&settings.logging)?;

    info!("Starting API cache admin server");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let bind = settings.admin_bind.clone();
    let cache_manager = CacheManager::connect(settings).await;
    if !cache_manager.health_check().await {
        tracing::warn!("Cache store is not healthy; requests will bypass the cache");
    }

    let app = CacheAdminRouter::create_router(CacheAdminState {
        cache_manager: cache_manager.clone(),
    });

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind admin server to {}", bind))?;
    info!("Cache admin API listening on {}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("admin server failed")?;

    info!("Waiting for background revalidations to finish");
    cache_manager.wait_for_background().await;
    info!("API cache shutdown complete");
    Ok(())
}

async fn load_settings(path: Option<String>) -> anyhow::Result<CacheSettings> {
    let Some(path) = path else {
        let mut settings = CacheSettings::default();
        settings.apply_env_overrides()?;
        settings.validate()?;
        return Ok(settings);
    };

    let is_json = Path::new(&path)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let settings = if is_json {
        CacheSettings::load_from_json(&path).await
    } else {
        CacheSettings::load_from_file(&path).await
    };

    settings.with_context(|| format!("failed to load settings from {}", path))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
