mod adaptive_window;
mod leaky_bucket;
mod registry;
mod sliding_window;
mod token_bucket;

pub use adaptive_window::AdaptiveWindow;
pub use leaky_bucket::LeakyBucket;
pub use registry::{InstanceKey, InstanceRegistry};
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

use crate::clock;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A rate-limit algorithm configured with one `(limit, window)` pair, owning
/// per-key counting state.
///
/// `try_admit` is the atomic decision: it advances the key's state to `now`
/// and returns whether the request is admitted. `now` comes from the crate
/// clock and is non-decreasing per key; a negative observed delta (two
/// callers racing between the clock read and the key lock) is clamped to
/// zero inside each implementation.
pub trait KeyedLimiter: Send + Sync {
    fn try_admit(&self, key: &str, now: f64) -> bool;

    /// Drop all state for `key`.
    fn reset(&self, key: &str);

    /// Read-only snapshot for monitoring and tests. `None` for unknown keys.
    fn stats(&self, key: &str, now: f64) -> Option<KeyStats>;

    /// Drop the key equal to `client_id` and every `client_id:route` key.
    fn reset_client(&self, client_id: &str);

    /// Drop keys whose last access predates `horizon` (seconds on the crate
    /// clock). Bounds per-key state growth for idle keys.
    fn evict_idle(&self, horizon: f64);
}

/// Per-key snapshot, tagged by algorithm.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum KeyStats {
    TokenBucket {
        tokens: f64,
        refill_rate: f64,
        time_to_full: f64,
    },
    LeakyBucket {
        level: f64,
        leak_rate: f64,
        time_to_empty: f64,
    },
    SlidingWindow {
        current_count: u32,
        remaining: u32,
        utilization: f64,
    },
    AdaptiveWindow {
        effective_limit: f64,
        effective_window: f64,
        current_count: u32,
        allow_ratio: f64,
    },
}

/// Keyed state map shared by all four algorithms: one `DashMap` entry per
/// key, the mutable record behind a `Mutex`, and a lock-free last-access
/// stamp (micros) updated outside the lock so eviction never contends with
/// admission decisions.
pub(crate) struct KeyTable<S> {
    entries: DashMap<String, Arc<KeyEntry<S>>>,
}

pub(crate) struct KeyEntry<S> {
    pub state: Mutex<S>,
    last_access: AtomicU64,
}

impl<S> KeyEntry<S> {
    pub fn touch(&self, now: f64) {
        self.last_access.store(clock::to_micros(now), Ordering::Relaxed);
    }
}

impl<S> KeyTable<S> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Fast path: existing key returns without allocating an owned `String`.
    pub fn get_or_insert_with(&self, key: &str, init: impl FnOnce() -> S) -> Arc<KeyEntry<S>> {
        if let Some(entry) = self.entries.get(key) {
            return entry.value().clone();
        }
        self.entries
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(KeyEntry {
                    state: Mutex::new(init()),
                    last_access: AtomicU64::new(clock::now_micros()),
                })
            })
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<Arc<KeyEntry<S>>> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn reset_client(&self, client_id: &str) {
        self.entries
            .retain(|key, _| key != client_id && !is_client_route_key(key, client_id));
    }

    pub fn evict_idle(&self, horizon: f64) {
        let horizon_us = clock::to_micros(horizon);
        self.entries
            .retain(|_, entry| entry.last_access.load(Ordering::Relaxed) >= horizon_us);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

fn is_client_route_key(key: &str, client_id: &str) -> bool {
    key.strip_prefix(client_id)
        .and_then(|rest| rest.strip_prefix(':'))
        .is_some()
}
