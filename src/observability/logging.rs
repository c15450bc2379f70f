//! # Structured Logging
//!
//! Subscriber setup for the cache. Library code only emits `tracing` events;
//! the embedding application (or the `api-cache` binary) decides where they go.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::core::error::{CacheError, CacheResult};
use crate::observability::config::{LogConfig, LogFormat};

/// Build the env filter, preferring `RUST_LOG` over the configured level
pub fn build_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("api_cache={},tower_http=info", config.level)))
}

/// Install the global subscriber.
///
/// Fails if a global subscriber has already been set.
pub fn init_logging(config: &LogConfig) -> CacheResult<()> {
    let filter = build_filter(config);
    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .json(),
            )
            .try_init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
    };

    result.map_err(|e| CacheError::config(format!("Failed to install log subscriber: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_second_init_fails() {
        let config = LogConfig {
            level: "debug".to_string(),
            format: LogFormat::Text,
        };
        // Another test may have installed the subscriber first; either way the
        // second call must report an error instead of panicking.
        let _ = init_logging(&config);
        assert!(init_logging(&config).is_err());
    }
}
