//! # Error Handling Module
//!
//! Error types for the caching engine, built with `thiserror`.
//!
//! Most of these errors never reach the code that wraps a handler with the
//! cache: the entry store, tag index and cache manager log them and degrade
//! to "caching disabled" behavior instead. They surface directly only from
//! configuration loading, the backing store adapters and the payload codec.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Main result type used throughout the cache
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-specific error types
#[derive(Debug, Error)]
pub enum CacheError {
    /// Backing store rejected or failed an operation
    #[error("Cache store error: {message}")]
    Store { message: String },

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis client errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Gzip compression or decompression failure
    #[error("Compression error: {0}")]
    Compression(std::io::Error),

    /// Stored payload is not valid base64
    #[error("Encoding error: {0}")]
    Encoding(#[from] base64::DecodeError),

    /// Stored payload is not valid UTF-8
    #[error("Payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// Key derivation errors
    #[error("Key generation error: {message}")]
    KeyGeneration { message: String },

    /// Invalid or unreadable configuration
    #[error("Cache configuration error: {message}")]
    Configuration { message: String },

    /// I/O errors (config files, sockets)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Background refresh of a stale entry did not produce a cacheable result
    #[error("Revalidation failed: {message}")]
    Revalidation { message: String },

    /// Malformed admin request
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// No backing store is reachable
    #[error("Cache not available")]
    Unavailable,
}

impl CacheError {
    /// Create a store error with a custom message
    pub fn store<S: Into<String>>(message: S) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a key generation error with a custom message
    pub fn key_generation<S: Into<String>>(message: S) -> Self {
        Self::KeyGeneration {
            message: message.into(),
        }
    }

    /// Create a revalidation error with a custom message
    pub fn revalidation<S: Into<String>>(message: S) -> Self {
        Self::Revalidation {
            message: message.into(),
        }
    }

    /// Create an invalid request error with a custom message
    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// HTTP status used when the error is returned from the admin API
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. } | Self::KeyGeneration { .. } => StatusCode::BAD_REQUEST,
            Self::Unavailable | Self::Redis(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable category
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Store { .. } => "store",
            Self::Serialization(_) => "serialization",
            Self::Redis(_) => "redis",
            Self::Compression(_) => "compression",
            Self::Encoding(_) => "encoding",
            Self::Utf8(_) => "utf8",
            Self::KeyGeneration { .. } => "key_generation",
            Self::Configuration { .. } => "configuration",
            Self::Io(_) => "io",
            Self::Revalidation { .. } => "revalidation",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Unavailable => "unavailable",
        }
    }

    /// Whether the error means the store itself is unreachable, as opposed
    /// to a problem with one particular entry
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Unavailable => true,
            Self::Redis(e) => e.is_io_error() || e.is_connection_dropped() || e.is_timeout(),
            _ => false,
        }
    }
}

impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_constructors() {
        let err = CacheError::config("bad threshold");
        assert_eq!(err.to_string(), "Cache configuration error: bad threshold");

        let err = CacheError::store("set failed");
        assert_eq!(err.to_string(), "Cache store error: set failed");
        assert!(!err.is_unavailable());
    }

    #[test]
    fn test_unavailable_classification() {
        assert!(CacheError::Unavailable.is_unavailable());
        assert!(!CacheError::key_generation("empty endpoint").is_unavailable());
    }

    #[test]
    fn test_serde_conversion() {
        let err: CacheError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, CacheError::Serialization(_)));
    }

    #[test]
    fn test_http_mapping() {
        let err = CacheError::invalid_request("tags are required");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.error_type(), "invalid_request");

        let response = CacheError::Unavailable.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
