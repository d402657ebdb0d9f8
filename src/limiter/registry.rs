use super::{AdaptiveWindow, KeyedLimiter, LeakyBucket, SlidingWindow, TokenBucket};
use crate::policy::AlgorithmKind;
use dashmap::DashMap;
use std::sync::Arc;

/// Identity of an algorithm instance. Reconfiguring a scope to a different
/// `(kind, limit, window)` resolves to a different instance; state under
/// the old triple stays alive until evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub kind: AlgorithmKind,
    pub limit: u32,
    pub window: u32,
}

/// Registry of algorithm instances, one per distinct `(kind, limit,
/// window)` triple. Idempotent: repeated lookups for the same triple return
/// the same instance, so per-key state survives across calls.
pub struct InstanceRegistry {
    instances: DashMap<InstanceKey, Arc<dyn KeyedLimiter>>,
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
        }
    }

    pub fn get_or_create(
        &self,
        kind: AlgorithmKind,
        limit: u32,
        window: u32,
    ) -> Arc<dyn KeyedLimiter> {
        let key = InstanceKey {
            kind,
            limit,
            window,
        };
        // Fast path: instance already exists.
        if let Some(entry) = self.instances.get(&key) {
            return entry.value().clone();
        }
        self.instances
            .entry(key)
            .or_insert_with(|| Self::build(kind, limit, window))
            .clone()
    }

    fn build(kind: AlgorithmKind, limit: u32, window: u32) -> Arc<dyn KeyedLimiter> {
        match kind {
            AlgorithmKind::TokenBucket => Arc::new(TokenBucket::new(limit, window)),
            AlgorithmKind::LeakyBucket => Arc::new(LeakyBucket::new(limit, window)),
            AlgorithmKind::SlidingWindow => Arc::new(SlidingWindow::new(limit, window)),
            AlgorithmKind::AdaptiveWindow => Arc::new(AdaptiveWindow::new(limit, window)),
        }
    }

    /// Drop `client_id`'s state in every live instance.
    pub fn reset_client(&self, client_id: &str) {
        for entry in self.instances.iter() {
            entry.value().reset_client(client_id);
        }
    }

    /// Drop idle per-key state across every live instance.
    pub fn evict_idle(&self, horizon: f64) {
        for entry in self.instances.iter() {
            entry.value().evict_idle(horizon);
        }
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Replace an instance outright. Test hook for fault injection.
    #[cfg(test)]
    pub(crate) fn insert(&self, key: InstanceKey, instance: Arc<dyn KeyedLimiter>) {
        self.instances.insert(key, instance);
    }
}
