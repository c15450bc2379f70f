//! Cache statistics.
//!
//! Per-key hit and miss counters plus a rolling window of response times,
//! kept in process memory only.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use super::entry_store::StoreSummary;

/// Default number of latency samples kept per key
pub const DEFAULT_LATENCY_WINDOW: usize = 100;

#[derive(Debug, Default)]
struct KeyStats {
    hits: u64,
    misses: u64,
    latencies: VecDeque<Duration>,
}

impl KeyStats {
    fn record_latency(&mut self, latency: Duration, window: usize) {
        if window == 0 {
            return;
        }
        while self.latencies.len() >= window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    fn latency_sum_ms(&self) -> f64 {
        self.latencies.iter().map(|l| l.as_secs_f64() * 1000.0).sum()
    }

    fn avg_latency_ms(&self) -> f64 {
        if self.latencies.is_empty() {
            0.0
        } else {
            self.latency_sum_ms() / self.latencies.len() as f64
        }
    }
}

/// Per-key line of the top list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyStatsSummary {
    pub key: String,
    pub hits: u64,
    pub misses: u64,
    pub avg_response_time_ms: f64,
}

/// Aggregated view returned by [`CacheManager::get_stats`](super::CacheManager::get_stats)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// hits / (hits + misses), 0.0 before any request
    pub hit_rate: f64,
    pub total_size_bytes: u64,
    pub item_count: u64,
    pub avg_response_time_ms: f64,
    pub top_keys: Vec<KeyStatsSummary>,
    pub collected_at: DateTime<Utc>,
}

/// Accumulates per-key counters and latencies
#[derive(Debug)]
pub struct StatsRecorder {
    keys: Mutex<HashMap<String, KeyStats>>,
    latency_window: usize,
    top_keys: usize,
}

impl Default for StatsRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_WINDOW, 10)
    }
}

impl StatsRecorder {
    pub fn new(latency_window: usize, top_keys: usize) -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            latency_window,
            top_keys,
        }
    }

    pub fn record_hit(&self, key: &str, latency: Duration) {
        let mut keys = self.keys.lock();
        let stats = keys.entry(key.to_string()).or_default();
        stats.hits += 1;
        stats.record_latency(latency, self.latency_window);
    }

    pub fn record_miss(&self, key: &str, latency: Duration) {
        let mut keys = self.keys.lock();
        let stats = keys.entry(key.to_string()).or_default();
        stats.misses += 1;
        stats.record_latency(latency, self.latency_window);
    }

    /// Forget everything recorded so far
    pub fn reset(&self) {
        self.keys.lock().clear();
    }

    /// Combine the counters with the store's size figures
    pub fn snapshot(&self, store: StoreSummary, now: DateTime<Utc>) -> CacheStats {
        let keys = self.keys.lock();

        let hits: u64 = keys.values().map(|s| s.hits).sum();
        let misses: u64 = keys.values().map(|s| s.misses).sum();
        let total = hits + misses;
        let hit_rate = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };

        let samples: usize = keys.values().map(|s| s.latencies.len()).sum();
        let avg_response_time_ms = if samples == 0 {
            0.0
        } else {
            keys.values().map(KeyStats::latency_sum_ms).sum::<f64>() / samples as f64
        };

        let mut top_keys: Vec<KeyStatsSummary> = keys
            .iter()
            .map(|(key, stats)| KeyStatsSummary {
                key: key.clone(),
                hits: stats.hits,
                misses: stats.misses,
                avg_response_time_ms: stats.avg_latency_ms(),
            })
            .collect();
        top_keys.sort_by(|a, b| b.hits.cmp(&a.hits).then_with(|| a.key.cmp(&b.key)));
        top_keys.truncate(self.top_keys);

        CacheStats {
            hits,
            misses,
            hit_rate,
            total_size_bytes: store.total_size_bytes,
            item_count: store.item_count,
            avg_response_time_ms,
            top_keys,
            collected_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_empty_snapshot() {
        let stats = StatsRecorder::default().snapshot(StoreSummary::default(), Utc::now());
        assert_eq!(stats.hit_rate, 0.0);
        assert_eq!(stats.avg_response_time_ms, 0.0);
        assert!(stats.top_keys.is_empty());
    }

    #[test]
    fn test_hit_rate_and_average() {
        let recorder = StatsRecorder::default();
        recorder.record_miss("a", ms(30));
        recorder.record_hit("a", ms(10));
        recorder.record_hit("a", ms(20));
        recorder.record_hit("b", ms(20));

        let stats = recorder.snapshot(
            StoreSummary {
                item_count: 2,
                total_size_bytes: 128,
            },
            Utc::now(),
        );
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 0.75);
        assert!((stats.avg_response_time_ms - 20.0).abs() < 1e-9);
        assert_eq!(stats.item_count, 2);
        assert_eq!(stats.total_size_bytes, 128);
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let recorder = StatsRecorder::new(3, 10);
        for latency in [100, 100, 1, 2, 3] {
            recorder.record_hit("k", ms(latency));
        }

        let stats = recorder.snapshot(StoreSummary::default(), Utc::now());
        assert_eq!(stats.top_keys[0].hits, 5);
        assert!((stats.top_keys[0].avg_response_time_ms - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_top_keys_ordering_and_limit() {
        let recorder = StatsRecorder::new(10, 2);
        for _ in 0..3 {
            recorder.record_hit("popular", ms(1));
        }
        recorder.record_hit("second", ms(1));
        recorder.record_miss("cold", ms(1));

        let stats = recorder.snapshot(StoreSummary::default(), Utc::now());
        let keys: Vec<&str> = stats.top_keys.iter().map(|k| k.key.as_str()).collect();
        assert_eq!(keys, vec!["popular", "second"]);
    }

    #[test]
    fn test_reset() {
        let recorder = StatsRecorder::default();
        recorder.record_hit("k", ms(5));
        recorder.reset();

        let stats = recorder.snapshot(StoreSummary::default(), Utc::now());
        assert_eq!(stats.hits, 0);
        assert!(stats.top_keys.is_empty());
    }
}
