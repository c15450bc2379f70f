//! # Cache Policy
//!
//! Per-call cache options and the per-operation default profiles.
//!
//! Different operation classes (categorization, tagging, content analysis,
//! recommendations, conversational) have very different freshness needs, so
//! call sites usually start from [`PolicyRegistry::lookup`] and adjust.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Name of the profile used when an operation name is not recognized
pub const DEFAULT_PROFILE: &str = "default";

/// Options accepted per call site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Payload lifetime in the backing store
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Labels used for bulk invalidation
    pub tags: Vec<String>,

    /// Window at the end of the TTL during which hits are served stale and
    /// refreshed in the background
    #[serde(with = "humantime_serde")]
    pub stale_while_revalidate: Option<Duration>,

    /// Request header names whose values take part in the cache key
    pub vary: Vec<String>,

    /// Allow the payload codec to compress large payloads
    pub compression: bool,

    /// Bypass the cache entirely for this call
    pub skip_cache: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            tags: Vec::new(),
            stale_while_revalidate: None,
            vary: Vec::new(),
            compression: true,
            skip_cache: false,
        }
    }
}

impl CacheOptions {
    /// Options with the given TTL and defaults for everything else
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Default::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_vary<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.vary = headers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_stale_while_revalidate(mut self, window: Duration) -> Self {
        self.stale_while_revalidate = Some(window);
        self
    }

    pub fn without_compression(mut self) -> Self {
        self.compression = false;
        self
    }

    pub fn skip(mut self) -> Self {
        self.skip_cache = true;
        self
    }

    /// Whether an entry of the given age should be served stale and refreshed.
    ///
    /// Always false when no stale-while-revalidate window is configured.
    pub fn is_stale(&self, age: Duration) -> bool {
        match self.stale_while_revalidate {
            Some(window) => age > self.ttl.saturating_sub(window),
            None => false,
        }
    }
}

/// Lookup table of default options keyed by operation name
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    profiles: HashMap<String, CacheOptions>,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyRegistry {
    /// Registry holding the built-in profiles
    pub fn new() -> Self {
        let hours = |h: u64| Duration::from_secs(h * 3600);
        let minutes = |m: u64| Duration::from_secs(m * 60);

        let mut profiles = HashMap::new();
        profiles.insert(
            "categorization".to_string(),
            CacheOptions::new(hours(24))
                .with_stale_while_revalidate(hours(1))
                .with_tags(["ai:categorization"]),
        );
        profiles.insert(
            "tagging".to_string(),
            CacheOptions::new(hours(12))
                .with_stale_while_revalidate(minutes(30))
                .with_tags(["ai:tagging"]),
        );
        profiles.insert(
            "content_analysis".to_string(),
            CacheOptions::new(hours(6))
                .with_stale_while_revalidate(minutes(30))
                .with_tags(["ai:content_analysis"]),
        );
        profiles.insert(
            "recommendations".to_string(),
            CacheOptions::new(hours(1))
                .with_stale_while_revalidate(minutes(10))
                .with_vary(["authorization"])
                .with_tags(["ai:recommendations"]),
        );
        profiles.insert(
            "conversational".to_string(),
            CacheOptions::new(minutes(5))
                .with_vary(["authorization"])
                .with_tags(["ai:conversational"]),
        );
        profiles.insert(DEFAULT_PROFILE.to_string(), CacheOptions::new(minutes(5)));

        Self { profiles }
    }

    /// Built-in profiles with `overrides` layered on top
    pub fn with_overrides(overrides: &HashMap<String, CacheOptions>) -> Self {
        let mut registry = Self::new();
        for (name, options) in overrides {
            registry.register(name, options.clone());
        }
        registry
    }

    /// Add or replace a profile
    pub fn register(&mut self, name: &str, options: CacheOptions) {
        self.profiles.insert(normalize(name), options);
    }

    /// Options for an operation, or the default profile when the name is unknown
    pub fn lookup(&self, operation: &str) -> CacheOptions {
        let normalized = normalize(operation);
        let name = alias(&normalized).unwrap_or(normalized.as_str());

        self.profiles
            .get(name)
            .or_else(|| self.profiles.get(DEFAULT_PROFILE))
            .cloned()
            .unwrap_or_default()
    }

    /// Names of all registered profiles
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn normalize(name: &str) -> String {
    name.trim()
        .to_ascii_lowercase()
        .replace(['-', ' '], "_")
}

fn alias(name: &str) -> Option<&'static str> {
    match name {
        "categorize" | "category" => Some("categorization"),
        "tag" | "tags" | "auto_tag" => Some("tagging"),
        "analyze" | "analysis" => Some("content_analysis"),
        "recommend" | "recommendation" => Some("recommendations"),
        "chat" | "conversation" => Some("conversational"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staleness_window() {
        let options = CacheOptions::new(Duration::from_secs(10))
            .with_stale_while_revalidate(Duration::from_secs(3));

        assert!(!options.is_stale(Duration::from_secs(5)));
        assert!(!options.is_stale(Duration::from_secs(7)));
        assert!(options.is_stale(Duration::from_secs(8)));
    }

    #[test]
    fn test_no_window_never_stale() {
        let options = CacheOptions::new(Duration::from_secs(10));
        assert!(!options.is_stale(Duration::from_secs(60)));
    }

    #[test]
    fn test_profile_lookup() {
        let registry = PolicyRegistry::new();

        let categorization = registry.lookup("categorization");
        assert_eq!(categorization.ttl, Duration::from_secs(24 * 3600));
        assert!(categorization.stale_while_revalidate.is_some());

        // Aliases and spelling variants resolve to the same profile
        assert_eq!(registry.lookup("Content-Analysis"), registry.lookup("analyze"));
        assert_eq!(registry.lookup("chat").vary, vec!["authorization".to_string()]);
    }

    #[test]
    fn test_unknown_operation_uses_default() {
        let registry = PolicyRegistry::new();
        let options = registry.lookup("summarize-everything");

        assert_eq!(options, registry.lookup(DEFAULT_PROFILE));
        assert_eq!(options.ttl, Duration::from_secs(300));
        assert!(options.stale_while_revalidate.is_none());
    }

    #[test]
    fn test_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert("Tagging".to_string(), CacheOptions::new(Duration::from_secs(42)));
        overrides.insert("goals".to_string(), CacheOptions::new(Duration::from_secs(7)));

        let registry = PolicyRegistry::with_overrides(&overrides);
        assert_eq!(registry.lookup("tags").ttl, Duration::from_secs(42));
        assert_eq!(registry.lookup("goals").ttl, Duration::from_secs(7));
        assert!(registry.names().contains(&"goals"));
    }

    #[test]
    fn test_options_deserialize_humantime() {
        let options: CacheOptions = serde_yaml::from_str(
            "ttl: 2h\nstale_while_revalidate: 5m\ntags: [bookmarks]\nvary: [accept-language]\n",
        )
        .unwrap();

        assert_eq!(options.ttl, Duration::from_secs(7200));
        assert_eq!(options.stale_while_revalidate, Some(Duration::from_secs(300)));
        assert_eq!(options.tags, vec!["bookmarks".to_string()]);
        assert!(options.compression);
        assert!(!options.skip_cache);
    }
}
