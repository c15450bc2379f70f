//! # Background Revalidation
//!
//! Bounded pool for refreshing stale entries off the request path. A key is
//! refreshed by at most one task at a time, and when every permit is taken
//! new refreshes are skipped rather than queued: the stale entry keeps being
//! served until a later hit finds a free slot.
//!
//! Failures are logged and published on a broadcast channel so callers can
//! observe them without the request that triggered the refresh ever seeing
//! an error.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, warn};

use crate::core::error::CacheResult;

const FAILURE_CHANNEL_CAPACITY: usize = 256;

/// A background refresh that did not complete
#[derive(Debug, Clone, Serialize)]
pub struct RevalidationFailure {
    pub key: String,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct RevalidationPool {
    permits: Arc<Semaphore>,
    capacity: usize,
    in_flight: Arc<DashMap<String, DateTime<Utc>>>,
    failures: broadcast::Sender<RevalidationFailure>,
}

impl RevalidationPool {
    /// Pool running at most `capacity` refreshes at once (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);

        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: Arc::new(DashMap::new()),
            failures,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of refreshes currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_revalidating(&self, key: &str) -> bool {
        self.in_flight.contains_key(key)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RevalidationFailure> {
        self.failures.subscribe()
    }

    /// Schedule `task` to refresh `key`.
    ///
    /// Returns false, without running the task, when `key` is already being
    /// refreshed or the pool is saturated. A task that errors or panics is
    /// reported as a [`RevalidationFailure`].
    pub fn submit<F>(&self, key: &str, task: F) -> bool
    where
        F: Future<Output = CacheResult<()>> + Send + 'static,
    {
        match self.in_flight.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                debug!("Revalidation of {} already in flight", key);
                return false;
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Utc::now());
            }
        }

        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.in_flight.remove(key);
                debug!("Revalidation pool saturated, skipping refresh of {}", key);
                return false;
            }
        };

        let key = key.to_string();
        let in_flight = Arc::clone(&self.in_flight);
        let failures = self.failures.clone();

        tokio::spawn(async move {
            let _permit = permit;

            // Inner task so a panicking handler is caught as a JoinError
            let reason = match tokio::spawn(task).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) => Some(format!("revalidation task aborted: {}", e)),
            };

            in_flight.remove(&key);

            match reason {
                None => debug!("Revalidated {}", key),
                Some(reason) => {
                    warn!("Background revalidation of {} failed: {}", key, reason);
                    // No receivers is fine
                    let _ = failures.send(RevalidationFailure {
                        key,
                        reason,
                        failed_at: Utc::now(),
                    });
                }
            }
        });

        true
    }

    /// Wait until every refresh submitted so far has finished
    pub async fn wait_idle(&self) {
        let wanted = u32::try_from(self.capacity).unwrap_or(u32::MAX);
        if let Ok(all) = self.permits.acquire_many(wanted).await {
            drop(all);
        }
    }
}
