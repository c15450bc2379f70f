//! # API Cache
//!
//! Response caching engine for API handlers. Wrap an idempotent handler with
//! [`CacheManager::get_or_compute`] and its successful results are stored in
//! a key-value backend (Redis or in-process), keyed deterministically on the
//! endpoint, its parameters and selected request headers.
//!
//! Caching is never load-bearing: if the backing store is missing or failing,
//! requests fall through to the handler and callers see no errors.

/// Error types and settings
pub mod core;

/// Cache engine: keys, codec, stores, invalidation, stats and the facade
pub mod caching;

/// Logging setup
pub mod observability;

pub use caching::{CacheManager, CacheOptions, CacheRequest, CacheStatus, HandlerResponse};
pub use core::config::CacheSettings;
pub use core::error::{CacheError, CacheResult};
