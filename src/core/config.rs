//! # Configuration Module
//!
//! Settings for the caching engine.
//!
//! ## Key Features
//! - YAML/JSON configuration parsing with serde
//! - Human-readable durations (`30s`, `5m`) via humantime
//! - Environment variable overrides (`API_CACHE_<FIELD>`)
//! - Validation with every problem reported at once

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::caching::policy::CacheOptions;
use crate::core::error::{CacheError, CacheResult};
use crate::observability::config::LogConfig;

/// Prefix of environment variables read by [`CacheSettings::apply_env_overrides`]
pub const ENV_PREFIX: &str = "API_CACHE_";

/// Complete cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// When false no backing store is attached and every call bypasses the cache
    pub enabled: bool,

    /// Namespace for payload and metadata keys
    pub key_prefix: String,

    /// Namespace for tag membership sets
    pub tag_prefix: String,

    /// Serialized payloads at or above this size are compressed
    pub compression_threshold: usize,

    /// Encoded payloads above this size are never stored
    pub max_entry_bytes: usize,

    /// Extra lifetime of metadata beyond its payload
    #[serde(with = "humantime_serde")]
    pub metadata_grace: Duration,

    /// Handler statuses whose results may be cached
    pub cacheable_statuses: Vec<u16>,

    /// Maximum number of concurrent background revalidations
    pub revalidation_concurrency: usize,

    /// Collapse concurrent misses for the same key into one handler call
    pub single_flight: bool,

    /// Latency samples kept per key
    pub latency_window: usize,

    /// Number of keys reported in the stats top list
    pub top_keys: usize,

    /// Redis backing store; the in-process store is used when absent
    pub redis: Option<RedisSettings>,

    /// Per-operation profile overrides
    pub profiles: HashMap<String, CacheOptions>,

    /// Bind address of the admin server
    pub admin_bind: String,

    /// Logging settings
    pub logging: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    /// Redis connection URL
    pub url: String,

    /// Maximum number of retries per command
    pub max_retries: u32,

    /// Base delay between retries
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            key_prefix: "api_cache:".to_string(),
            tag_prefix: "api_cache_tag:".to_string(),
            compression_threshold: 1024,
            max_entry_bytes: 100 * 1024 * 1024, // 100MB
            metadata_grace: Duration::from_secs(60),
            cacheable_statuses: vec![200],
            revalidation_concurrency: 8,
            single_flight: true,
            latency_window: 100,
            top_keys: 10,
            redis: None,
            profiles: HashMap::new(),
            admin_bind: "127.0.0.1:9190".to_string(),
            logging: LogConfig::default(),
        }
    }
}

impl CacheSettings {
    /// Load settings from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> CacheResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CacheError::config(format!("Failed to read config file: {}", e)))?;

        let mut settings: CacheSettings = serde_yaml::from_str(&content)
            .map_err(|e| CacheError::config(format!("Failed to parse config: {}", e)))?;

        settings.apply_env_overrides()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a JSON file
    pub async fn load_from_json<P: AsRef<Path>>(path: P) -> CacheResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CacheError::config(format!("Failed to read config file: {}", e)))?;

        let mut settings: CacheSettings = serde_json::from_str(&content)
            .map_err(|e| CacheError::config(format!("Failed to parse JSON config: {}", e)))?;

        settings.apply_env_overrides()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply environment variable overrides
    ///
    /// Variables follow the pattern `API_CACHE_<FIELD>`, e.g.
    /// `API_CACHE_COMPRESSION_THRESHOLD=2048` or `API_CACHE_REDIS_URL=redis://cache:6379`.
    pub fn apply_env_overrides(&mut self) -> CacheResult<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable source
    pub fn apply_overrides<F>(&mut self, lookup: F) -> CacheResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |field: &str| lookup(&format!("{}{}", ENV_PREFIX, field));

        if let Some(enabled) = var("ENABLED") {
            self.enabled = parse_var("ENABLED", &enabled)?;
        }

        if let Some(threshold) = var("COMPRESSION_THRESHOLD") {
            self.compression_threshold = parse_var("COMPRESSION_THRESHOLD", &threshold)?;
        }

        if let Some(max) = var("MAX_ENTRY_BYTES") {
            self.max_entry_bytes = parse_var("MAX_ENTRY_BYTES", &max)?;
        }

        if let Some(grace) = var("METADATA_GRACE") {
            self.metadata_grace = humantime::parse_duration(&grace)
                .map_err(|e| CacheError::config(format!("Invalid {}METADATA_GRACE: {}", ENV_PREFIX, e)))?;
        }

        if let Some(concurrency) = var("REVALIDATION_CONCURRENCY") {
            self.revalidation_concurrency = parse_var("REVALIDATION_CONCURRENCY", &concurrency)?;
        }

        if let Some(single_flight) = var("SINGLE_FLIGHT") {
            self.single_flight = parse_var("SINGLE_FLIGHT", &single_flight)?;
        }

        if let Some(url) = var("REDIS_URL") {
            self.redis.get_or_insert_with(RedisSettings::default).url = url;
        }

        if let Some(bind) = var("ADMIN_BIND") {
            self.admin_bind = bind;
        }

        if let Some(level) = var("LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(format) = var("LOG_FORMAT") {
            self.logging.format = format
                .parse()
                .map_err(|e| CacheError::config(format!("Invalid {}LOG_FORMAT: {}", ENV_PREFIX, e)))?;
        }

        Ok(())
    }

    /// Validate settings, reporting every problem found
    pub fn validate(&self) -> CacheResult<()> {
        let mut errors = Vec::new();

        if self.key_prefix.is_empty() {
            errors.push("key_prefix must not be empty".to_string());
        }

        if self.tag_prefix.is_empty() {
            errors.push("tag_prefix must not be empty".to_string());
        }

        if !self.key_prefix.is_empty() && self.tag_prefix.starts_with(&self.key_prefix) {
            errors.push("tag_prefix must not live inside key_prefix".to_string());
        }

        if self.max_entry_bytes == 0 {
            errors.push("max_entry_bytes must be greater than zero".to_string());
        }

        if self.revalidation_concurrency == 0 {
            errors.push("revalidation_concurrency must be greater than zero".to_string());
        }

        if self.latency_window == 0 {
            errors.push("latency_window must be greater than zero".to_string());
        }

        if self.cacheable_statuses.is_empty() {
            errors.push("cacheable_statuses must list at least one status".to_string());
        }

        for status in &self.cacheable_statuses {
            if !(100..=599).contains(status) {
                errors.push(format!("cacheable status {} is not a valid HTTP status", status));
            }
        }

        for (name, profile) in &self.profiles {
            if let Some(window) = profile.stale_while_revalidate {
                if window > profile.ttl {
                    errors.push(format!(
                        "profile '{}': stale_while_revalidate exceeds ttl",
                        name
                    ));
                }
            }
        }

        if let Some(redis) = &self.redis {
            if !redis.url.starts_with("redis://") && !redis.url.starts_with("rediss://") {
                errors.push(format!("redis url '{}' must use redis:// or rediss://", redis.url));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CacheError::config(errors.join("; ")))
        }
    }
}

fn parse_var<T>(field: &str, value: &str) -> CacheResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| CacheError::config(format!("Invalid {}{}: {}", ENV_PREFIX, field, e)))
}
