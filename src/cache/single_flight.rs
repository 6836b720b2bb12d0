//! Single-Flight Loading
//!
//! Coalesces concurrent cache-miss computations for the same key: the first
//! caller (the leader) runs the loader, everyone else arriving while it runs
//! waits for the leader's result instead of repeating the work.
//!
//! # Design
//!
//! - In-flight registry is a `DashMap<K, watch::Receiver<..>>`; insertion
//!   through the entry API decides leadership atomically
//! - The leader publishes once through a `watch` channel, which wakes every
//!   waiter at the same time
//! - A drop guard removes the registry entry whether the loader succeeds,
//!   fails, panics or is cancelled, so a key can never stay wedged
//! - A leader's error is returned to the leader as-is; waiters receive
//!   `Error::LoaderFailed` carrying its message, or `Error::LoadAbandoned`
//!   when the leader went away without publishing

use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{Error, Result};

type Published<V> = Option<std::result::Result<V, String>>;

enum Role<V> {
    Leader(watch::Sender<Published<V>>),
    Follower(watch::Receiver<Published<V>>),
}

/// Removes the leader's registry entry on every exit path
struct FlightGuard<'a, K: Hash + Eq, V> {
    in_flight: &'a DashMap<K, watch::Receiver<Published<V>>>,
    key: K,
}

impl<K: Hash + Eq, V> Drop for FlightGuard<'_, K, V> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

/// Per-key in-flight registry
pub struct SingleFlight<K: Hash + Eq, V> {
    in_flight: DashMap<K, watch::Receiver<Published<V>>>,
    leaders: AtomicU64,
    coalesced: AtomicU64,
    failures: AtomicU64,
}

impl<K, V> SingleFlight<K, V>
where
    K: Hash + Eq + Clone + std::fmt::Debug,
    V: Clone,
{
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            in_flight: DashMap::new(),
            leaders: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Run `load` for `key` unless a load for the same key is already
    /// running, in which case wait for and share its result.
    pub async fn run<F, Fut>(&self, key: K, load: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let role = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => Role::Follower(entry.get().clone()),
            Entry::Vacant(entry) => {
                let (sender, receiver) = watch::channel(None);
                entry.insert(receiver);
                Role::Leader(sender)
            }
        };

        match role {
            Role::Leader(sender) => {
                self.leaders.fetch_add(1, Ordering::Relaxed);
                let _guard = FlightGuard {
                    in_flight: &self.in_flight,
                    key,
                };

                let outcome = load().await;
                let published = match &outcome {
                    Ok(value) => Ok(value.clone()),
                    Err(e) => {
                        self.failures.fetch_add(1, Ordering::Relaxed);
                        Err(e.to_string())
                    }
                };
                sender.send_replace(Some(published));
                outcome
            }
            Role::Follower(mut receiver) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(key = ?key, "Waiting on in-flight load");

                let waited = receiver.wait_for(|published| published.is_some()).await;
                match waited {
                    Ok(published) => match published.as_ref() {
                        Some(Ok(value)) => Ok(value.clone()),
                        Some(Err(message)) => Err(Error::LoaderFailed(message.clone())),
                        None => Err(Error::LoadAbandoned),
                    },
                    Err(_) => Err(Error::LoadAbandoned),
                }
            }
        }
    }

    /// Loads currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Loads executed by a leader
    pub fn leader_count(&self) -> u64 {
        self.leaders.load(Ordering::Relaxed)
    }

    /// Callers that shared another caller's load
    pub fn coalesced_count(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    /// Leader loads that failed
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Hash + Eq + Clone + std::fmt::Debug,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
