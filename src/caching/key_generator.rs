//! # Cache Key Generator
//!
//! Derives deterministic cache keys from an endpoint identifier, the request
//! parameters and the values of the headers a call varies on.
//!
//! Parameters and vary values are canonicalized with their keys sorted, so the
//! order in which a caller built its maps never changes the derived key. The
//! canonical triple is hashed with SHA-256 and namespaced with a prefix.

use axum::http::HeaderMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

use crate::core::error::{CacheError, CacheResult};

/// Default namespace for derived keys
pub const DEFAULT_KEY_PREFIX: &str = "api_cache:";

/// Derive a key with the default prefix.
///
/// Equal inputs always derive the same key, regardless of map insertion order.
pub fn derive_key(
    endpoint: &str,
    params: &HashMap<String, Value>,
    vary: &HashMap<String, String>,
) -> String {
    KeyGenerator::default().derive(endpoint, params, vary)
}

/// Key derivation with a configurable namespace
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    prefix: String,
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

impl KeyGenerator {
    pub fn new<S: Into<String>>(prefix: S) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Derive the cache key for an (endpoint, params, vary) triple
    pub fn derive(
        &self,
        endpoint: &str,
        params: &HashMap<String, Value>,
        vary: &HashMap<String, String>,
    ) -> String {
        let sorted_params: BTreeMap<&String, &Value> = params.iter().collect();
        let sorted_vary: BTreeMap<&String, &String> = vary.iter().collect();

        // A JSON array keeps the three components unambiguous: no endpoint or
        // parameter text can be mistaken for a separator.
        let canonical = serde_json::json!([endpoint, sorted_params, sorted_vary]).to_string();

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("{}{}", self.prefix, hex::encode(hasher.finalize()))
    }

    /// Like [`derive`](Self::derive) but rejects an empty endpoint
    pub fn try_derive(
        &self,
        endpoint: &str,
        params: &HashMap<String, Value>,
        vary: &HashMap<String, String>,
    ) -> CacheResult<String> {
        if endpoint.trim().is_empty() {
            return Err(CacheError::key_generation("Endpoint identifier cannot be empty"));
        }
        Ok(self.derive(endpoint, params, vary))
    }

    /// Whether `key` was derived under this generator's namespace
    pub fn owns(&self, key: &str) -> bool {
        key.starts_with(&self.prefix)
    }
}

/// Pick the values of the named headers out of a request's headers.
///
/// Names are matched case-insensitively and stored lowercased; headers that
/// are absent or not valid UTF-8 are left out.
pub fn vary_values(headers: &HeaderMap, names: &[String]) -> HashMap<String, String> {
    names
        .iter()
        .filter_map(|name| {
            let name = name.to_ascii_lowercase();
            let value = headers.get(name.as_str())?.to_str().ok()?.to_string();
            Some((name, value))
        })
        .collect()
}
