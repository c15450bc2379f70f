//! # Cache Stores Module
//!
//! The minimal key-value capability the cache needs from its backing store,
//! with an in-process implementation and a Redis implementation.

pub mod memory;
pub mod redis_store;

pub use memory::InMemoryStore;
pub use redis_store::RedisStore;

use crate::core::error::CacheResult;
use async_trait::async_trait;
use std::time::Duration;

/// Trait for backing store implementations
///
/// Patterns passed to [`keys_matching`](KvStore::keys_matching) are globs
/// where `*` matches any run of characters.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get a value, `None` if absent or expired
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Set a value that expires after `ttl`
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()>;

    /// Delete a key of any kind, returning how many keys were removed
    async fn delete(&self, key: &str) -> CacheResult<u64>;

    /// List keys matching a glob pattern
    async fn keys_matching(&self, pattern: &str) -> CacheResult<Vec<String>>;

    /// Add a member to a set, creating the set if needed
    async fn set_add(&self, set_key: &str, member: &str) -> CacheResult<()>;

    /// Remove a member from a set; removing an absent member is not an error
    async fn set_remove(&self, set_key: &str, member: &str) -> CacheResult<()>;

    /// Members of a set, empty if the set does not exist
    async fn set_members(&self, set_key: &str) -> CacheResult<Vec<String>>;

    /// Perform health check
    async fn health_check(&self) -> CacheResult<bool>;
}

/// Glob matching with `*` wildcards, as used by Redis `SCAN MATCH`
pub fn glob_matches(pattern: &str, candidate: &str) -> bool {
    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or_default();
    let Some(mut rest) = candidate.strip_prefix(first) else {
        return false;
    };

    let remaining: Vec<&str> = parts.collect();
    let Some((last, middle)) = remaining.split_last() else {
        // No wildcard at all: exact match
        return rest.is_empty();
    };

    for part in middle {
        match rest.find(part) {
            Some(index) => rest = &rest[index + part.len()..],
            None => return false,
        }
    }

    rest.len() >= last.len() && rest.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_matching() {
        assert!(glob_matches("api_cache:*", "api_cache:abc"));
        assert!(glob_matches("api_cache:*", "api_cache:"));
        assert!(!glob_matches("api_cache:*", "api_cache_tag:bookmarks"));
        assert!(glob_matches("api_cache:*:meta", "api_cache:abc:meta"));
        assert!(!glob_matches("api_cache:*:meta", "api_cache:abc"));
        assert!(glob_matches("exact", "exact"));
        assert!(!glob_matches("exact", "exactly"));
        assert!(glob_matches("*", "anything"));
        assert!(glob_matches("a*b*c", "a-x-b-y-c"));
        assert!(!glob_matches("a*b*c", "a-x-c-y-b"));
    }
}
