//! # Request Deduplication Module
//!
//! Single-flight for cache misses. The first caller to miss on a key becomes
//! the leader and computes the value; callers that miss on the same key while
//! the leader is running join its result instead of invoking the handler
//! again.
//!
//! If the leader goes away without completing (its future was dropped or the
//! handler panicked), followers are released empty-handed and compute for
//! themselves.

use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

type SharedValue = Arc<dyn Any + Send + Sync>;
type Flights = Arc<Mutex<HashMap<String, watch::Receiver<Option<SharedValue>>>>>;

/// Registry of in-flight computations keyed by cache key
#[derive(Clone, Default)]
pub struct SingleFlight {
    flights: Flights,
}

/// Role assigned by [`SingleFlight::join`]
pub enum Flight {
    Leader(FlightLeader),
    Follower(FlightFollower),
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Become the leader for `key`, or follow the computation already running
    pub fn join(&self, key: &str) -> Flight {
        let mut flights = self.flights.lock();

        if let Some(receiver) = flights.get(key) {
            debug!("Joining in-flight computation for {}", key);
            return Flight::Follower(FlightFollower {
                receiver: receiver.clone(),
            });
        }

        let (sender, receiver) = watch::channel(None);
        flights.insert(key.to_string(), receiver);

        Flight::Leader(FlightLeader {
            key: key.to_string(),
            sender,
            flights: Arc::clone(&self.flights),
        })
    }

    /// Number of keys with a computation in flight
    pub fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }
}

/// Held by the caller computing a key; dropping it ends the flight
pub struct FlightLeader {
    key: String,
    sender: watch::Sender<Option<SharedValue>>,
    flights: Flights,
}

impl FlightLeader {
    /// Hand `value` to every follower and end the flight
    pub fn complete<T: Send + Sync + 'static>(self, value: T) {
        // Followers may all have given up already
        let _ = self.sender.send(Some(Arc::new(value)));
    }
}

impl Drop for FlightLeader {
    fn drop(&mut self) {
        self.flights.lock().remove(&self.key);
    }
}

pub struct FlightFollower {
    receiver: watch::Receiver<Option<SharedValue>>,
}

impl FlightFollower {
    /// Wait for the leader's value.
    ///
    /// `None` if the leader ended without completing, or completed with a
    /// value of a different type.
    pub async fn wait<T: Clone + 'static>(mut self) -> Option<T> {
        let shared = {
            let value = self.receiver.wait_for(Option::is_some).await.ok()?;
            value.as_ref().map(Arc::clone)?
        };
        shared.downcast_ref::<T>().cloned()
    }
}
