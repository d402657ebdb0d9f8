mod monitor;

use crate::clock;
use crate::config::ShieldConfig;
use crate::error::{RateLimitExceeded, ShieldError};
use crate::limiter::{InstanceRegistry, KeyStats};
use crate::metrics::{FrameSnapshot, GlobalStats, MetricsStore};
use crate::policy::{AlgorithmKind, Policy, PolicyScope, PolicyStore, ResolvedPolicy, ScopedLimit};
use serde::Serialize;
use std::borrow::Cow;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Adaptive admission controller: resolves the applicable policy for each
/// `(client, route)` pair, drives the matching algorithm instance, records
/// metrics, and runs a background monitor for retention and adaptation.
///
/// Cheaply cloneable; clones share all state. `admit` is synchronous and
/// non-blocking beyond uncontended short critical sections, so it can be
/// called from async handlers directly.
#[derive(Clone)]
pub struct Shield {
    inner: Arc<ShieldInner>,
}

struct ShieldInner {
    policies: PolicyStore,
    registry: InstanceRegistry,
    metrics: MetricsStore,
    default_limit: u32,
    default_window: u32,
    default_kind: AlgorithmKind,
    auto_adapt: bool,
    metrics_retention_secs: u64,
    shutdown: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Per-route statistics and configuration view.
#[derive(Debug, Clone, Serialize)]
pub struct RouteStats {
    pub route: String,
    pub exists: bool,
    pub policy: Option<Policy>,
    pub metrics: Option<FrameSnapshot>,
}

/// Per-client statistics and configuration view. Counters aggregate over
/// every route the client has touched within the retention horizon.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub client_id: String,
    pub exists: bool,
    pub policy: Option<ScopedLimit>,
    pub route_policies: HashMap<String, ScopedLimit>,
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub rejected_requests: u64,
    pub rejection_rate: f64,
    pub routes: HashMap<String, FrameSnapshot>,
    pub avg_latency_ms: Option<f64>,
}

impl Shield {
    /// Build a shield from the given configuration, seed any configured
    /// policies, and start the monitor task (when `monitor_interval_secs`
    /// is non-zero, which requires a tokio runtime).
    pub fn new(config: ShieldConfig) -> Result<Self, ShieldError> {
        config.validate()?;
        let default =
            Policy::new(config.default_limit, config.default_window, config.default_kind)?;

        let shield = Self {
            inner: Arc::new(ShieldInner {
                policies: PolicyStore::new(default),
                registry: InstanceRegistry::new(),
                metrics: MetricsStore::new(clock::now()),
                default_limit: config.default_limit,
                default_window: config.default_window,
                default_kind: config.default_kind,
                auto_adapt: config.auto_adapt,
                metrics_retention_secs: config.metrics_retention_secs,
                shutdown: CancellationToken::new(),
                monitor: Mutex::new(None),
            }),
        };

        for route in &config.routes {
            shield.set_route_limit(&route.route, route.limit, route.window, route.kind)?;
        }
        for client in &config.clients {
            shield.set_client_limit(&client.client_id, client.limit, client.window, client.kind)?;
        }
        for entry in &config.client_routes {
            shield.set_client_route_limit(
                &entry.client_id,
                &entry.route,
                entry.limit,
                entry.window,
                entry.kind,
            )?;
        }

        if config.monitor_interval_secs > 0 {
            let handle = tokio::spawn(monitor::run(
                shield.clone(),
                config.monitor_interval_secs,
                shield.inner.shutdown.clone(),
            ));
            *shield.inner.monitor.lock().unwrap() = Some(handle);
        }

        info!(
            "shield: initialized, default_limit={}, default_window={}s, default_kind={}, monitor_interval={}s, auto_adapt={}",
            config.default_limit,
            config.default_window,
            config.default_kind,
            config.monitor_interval_secs,
            config.auto_adapt
        );
        Ok(shield)
    }

    /// Decide whether to admit one request.
    ///
    /// Resolves the most specific policy for `(client, route)`, obtains the
    /// matching algorithm instance, and runs its decision under the key
    /// `"{client}:{route}"` for route-scoped and default policies (each
    /// client then gets its own budget on the route) or `client` alone for
    /// client-scoped policies. Any fault inside the algorithm fails open:
    /// the request is admitted and the fault logged.
    pub fn admit(&self, client_id: &str, route: Option<&str>) -> bool {
        let t0 = clock::now();
        let resolved = self.inner.policies.resolve(client_id, route);
        let instance = self.inner.registry.get_or_create(
            resolved.policy.kind,
            resolved.policy.limit,
            resolved.policy.window,
        );
        let key = admission_key(client_id, route, resolved.scope);

        let admitted = match catch_unwind(AssertUnwindSafe(|| instance.try_admit(&key, t0))) {
            Ok(decision) => decision,
            Err(_) => {
                error!(
                    "shield: algorithm fault, failing open, client={}, route={}, kind={}",
                    client_id,
                    route.unwrap_or("-"),
                    resolved.policy.kind
                );
                metrics::counter!("shield_limiter_failures_total").increment(1);
                true
            }
        };

        let now = clock::now();
        self.inner
            .metrics
            .record(client_id, route, admitted, (now - t0) * 1000.0, now);

        let route_label = route.unwrap_or("-").to_string();
        metrics::counter!("shield_requests_total").increment(1);
        if admitted {
            metrics::counter!("shield_admitted_total", "route" => route_label).increment(1);
        } else {
            metrics::counter!("shield_rejected_total", "route" => route_label).increment(1);
        }
        metrics::histogram!("shield_decision_duration_seconds").record(now - t0);

        admitted
    }

    /// [`admit`](Self::admit), but rejections become a typed error carrying
    /// the `Retry-After` value adapters are expected to surface.
    pub fn admit_or_reject(
        &self,
        client_id: &str,
        route: Option<&str>,
    ) -> Result<(), RateLimitExceeded> {
        if self.admit(client_id, route) {
            return Ok(());
        }
        let resolved = self.inner.policies.resolve(client_id, route);
        Err(RateLimitExceeded {
            client_id: client_id.to_string(),
            route: route.map(str::to_string),
            retry_after: u64::from(resolved.policy.window).min(60),
        })
    }

    /// Set or replace the policy for a route. `route` may end in `*` for
    /// prefix matching. Missing `window`/`kind` take the shield defaults.
    pub fn set_route_limit(
        &self,
        route: &str,
        limit: u32,
        window: Option<u32>,
        kind: Option<AlgorithmKind>,
    ) -> Result<(), ShieldError> {
        let policy = Policy::new(
            limit,
            window.unwrap_or(self.inner.default_window),
            kind.unwrap_or(self.inner.default_kind),
        )?;
        self.inner.policies.set_route_policy(route, policy);
        Ok(())
    }

    /// Set or replace the policy for a client. A missing `kind` keeps
    /// following the shield default kind.
    pub fn set_client_limit(
        &self,
        client_id: &str,
        limit: u32,
        window: Option<u32>,
        kind: Option<AlgorithmKind>,
    ) -> Result<(), ShieldError> {
        let scoped = self.scoped_limit(limit, window, kind)?;
        self.inner.policies.set_client_policy(client_id, scoped);
        Ok(())
    }

    /// Set or replace the policy for one (client, route) pair — the most
    /// specific scope.
    pub fn set_client_route_limit(
        &self,
        client_id: &str,
        route: &str,
        limit: u32,
        window: Option<u32>,
        kind: Option<AlgorithmKind>,
    ) -> Result<(), ShieldError> {
        let scoped = self.scoped_limit(limit, window, kind)?;
        self.inner
            .policies
            .set_client_route_policy(client_id, route, scoped);
        Ok(())
    }

    pub fn get_global_stats(&self) -> GlobalStats {
        self.inner.metrics.global_snapshot(clock::now())
    }

    pub fn get_route_stats(&self, route: &str) -> RouteStats {
        let policy = self.inner.policies.route_policy(route);
        let metrics = self.inner.metrics.route_snapshot(route);
        RouteStats {
            route: route.to_string(),
            exists: policy.is_some() || metrics.is_some(),
            policy,
            metrics,
        }
    }

    pub fn get_client_stats(&self, client_id: &str) -> ClientStats {
        let policy = self.inner.policies.client_policy(client_id);
        let route_policies: HashMap<String, ScopedLimit> = self
            .inner
            .policies
            .client_route_policies(client_id)
            .into_iter()
            .collect();
        let routes = self
            .inner
            .metrics
            .client_snapshot(client_id)
            .unwrap_or_default();

        let total: u64 = routes.values().map(|f| f.total_requests).sum();
        let allowed: u64 = routes.values().map(|f| f.allowed_requests).sum();
        let rejected: u64 = routes.values().map(|f| f.rejected_requests).sum();

        ClientStats {
            client_id: client_id.to_string(),
            exists: policy.is_some() || !route_policies.is_empty() || !routes.is_empty(),
            policy,
            route_policies,
            total_requests: total,
            allowed_requests: allowed,
            rejected_requests: rejected,
            rejection_rate: if total > 0 {
                rejected as f64 / total as f64
            } else {
                0.0
            },
            avg_latency_ms: self.inner.metrics.client_latency_avg(client_id),
            routes,
        }
    }

    /// The resolved policy for `(client, route)` and the scope it came
    /// from, without touching any algorithm state.
    pub fn resolve_policy(&self, client_id: &str, route: Option<&str>) -> ResolvedPolicy {
        self.inner.policies.resolve(client_id, route)
    }

    /// Per-key algorithm snapshot for the key `(client, route)` resolves
    /// to. `None` when the key has no state yet.
    pub fn key_stats(&self, client_id: &str, route: Option<&str>) -> Option<KeyStats> {
        let resolved = self.inner.policies.resolve(client_id, route);
        let instance = self.inner.registry.get_or_create(
            resolved.policy.kind,
            resolved.policy.limit,
            resolved.policy.window,
        );
        let key = admission_key(client_id, route, resolved.scope);
        instance.stats(&key, clock::now())
    }

    /// Drop the client's algorithm state in every instance and its metric
    /// frames. No-op for unknown clients.
    pub fn reset_client(&self, client_id: &str) {
        self.inner.registry.reset_client(client_id);
        self.inner.metrics.remove_client(client_id);
        info!("shield: client reset, client={}", client_id);
    }

    /// Zero all metric frames and restart the global observation window.
    pub fn reset_statistics(&self) {
        self.inner.metrics.reset(clock::now());
        info!("shield: statistics reset");
    }

    /// Stop the monitor task: set the stop signal, then wait up to one
    /// second before abandoning it. Admission keeps working afterwards.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = self.inner.monitor.lock().unwrap().take();
        if let Some(handle) = handle {
            match tokio::time::timeout(std::time::Duration::from_secs(1), handle).await {
                Ok(_) => info!("shield: monitor stopped"),
                Err(_) => warn!("shield: monitor did not stop within grace period, abandoning"),
            }
        }
    }

    fn scoped_limit(
        &self,
        limit: u32,
        window: Option<u32>,
        kind: Option<AlgorithmKind>,
    ) -> Result<ScopedLimit, ShieldError> {
        if limit < 1 {
            return Err(ShieldError::InvalidLimit);
        }
        let window = window.unwrap_or(self.inner.default_window);
        if window < 1 {
            return Err(ShieldError::InvalidWindow);
        }
        Ok(ScopedLimit {
            limit,
            window,
            kind,
        })
    }
}

/// The key an algorithm partitions state by. Client-scoped policies use the
/// bare client id (one budget across all routes); route-scoped and default
/// policies use `"{client}:{route}"` so each client gets its own budget per
/// route. Stable and observable through `reset_client`.
fn admission_key<'a>(client_id: &'a str, route: Option<&str>, scope: PolicyScope) -> Cow<'a, str> {
    match (scope, route) {
        (PolicyScope::Client | PolicyScope::ClientRoute, _) | (_, None) => {
            Cow::Borrowed(client_id)
        }
        (_, Some(route)) => Cow::Owned(format!("{client_id}:{route}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::{InstanceKey, KeyedLimiter};

    fn manual_shield(config: ShieldConfig) -> Shield {
        // monitor_interval 0: no task is spawned, so no runtime is needed
        // and monitor passes run only when driven explicitly.
        Shield::new(ShieldConfig {
            monitor_interval_secs: 0,
            ..config
        })
        .unwrap()
    }

    fn default_shield() -> Shield {
        manual_shield(ShieldConfig::default())
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = Shield::new(ShieldConfig {
            default_limit: 0,
            monitor_interval_secs: 0,
            ..ShieldConfig::default()
        });
        assert!(matches!(err, Err(ShieldError::InvalidLimit)));
    }

    #[test]
    fn test_default_policy_enforced() {
        let shield = manual_shield(ShieldConfig {
            default_limit: 10,
            default_window: 60,
            ..ShieldConfig::default()
        });
        let admitted = (0..15).filter(|_| shield.admit("c", Some("/a"))).count();
        assert_eq!(admitted, 10);
    }

    #[test]
    fn test_route_scoped_budget_is_per_client() {
        let shield = default_shield();
        shield.set_route_limit("/r", 1, None, None).unwrap();

        assert!(shield.admit("alice", Some("/r")));
        // A different client has its own budget on the same route.
        assert!(shield.admit("bob", Some("/r")));
        // The same client is now out of budget.
        assert!(!shield.admit("alice", Some("/r")));
    }

    #[test]
    fn test_client_scoped_budget_spans_routes() {
        let shield = default_shield();
        shield.set_client_limit("c", 1, None, None).unwrap();

        assert!(shield.admit("c", Some("/a")));
        // Same key ("c") regardless of route, so the budget is shared.
        assert!(!shield.admit("c", Some("/b")));
        assert!(!shield.admit("c", None));
    }

    #[test]
    fn test_seeded_policies_apply() {
        let config: ShieldConfig = serde_json::from_str(
            r#"{
                "monitor_interval_secs": 0,
                "routes": [{"route": "/a", "limit": 2, "window": 60}],
                "clients": [{"client_id": "vip", "limit": 1000}]
            }"#,
        )
        .unwrap();
        let shield = Shield::new(config).unwrap();

        assert_eq!(
            shield.resolve_policy("x", Some("/a")).policy.limit,
            2
        );
        assert_eq!(shield.resolve_policy("vip", None).policy.limit, 1000);
    }

    #[test]
    fn test_setter_error_leaves_policy_unchanged() {
        let shield = default_shield();
        shield.set_route_limit("/a", 50, None, None).unwrap();
        assert!(shield.set_route_limit("/a", 0, None, None).is_err());
        assert!(shield
            .set_route_limit("/a", 10, Some(0), None)
            .is_err());
        assert_eq!(shield.resolve_policy("c", Some("/a")).policy.limit, 50);
    }

    #[test]
    fn test_reconfiguration_affects_next_admit() {
        let shield = default_shield();
        shield.set_route_limit("/a", 1, None, None).unwrap();
        assert!(shield.admit("c", Some("/a")));
        assert!(!shield.admit("c", Some("/a")));

        // A fresh (limit, window) resolves to a fresh instance; the next
        // admit starts from a full budget.
        shield.set_route_limit("/a", 2, None, None).unwrap();
        assert!(shield.admit("c", Some("/a")));
    }

    #[test]
    fn test_admit_or_reject_carries_retry_after() {
        let shield = default_shield();
        shield
            .set_route_limit("/slow", 1, Some(120), None)
            .unwrap();
        shield.set_route_limit("/fast", 1, Some(30), None).unwrap();

        assert!(shield.admit_or_reject("c", Some("/slow")).is_ok());
        let err = shield.admit_or_reject("c", Some("/slow")).unwrap_err();
        assert_eq!(err.retry_after, 60); // min(120, 60)
        assert_eq!(err.client_id, "c");
        assert_eq!(err.route.as_deref(), Some("/slow"));

        shield.admit("c", Some("/fast"));
        let err = shield.admit_or_reject("c", Some("/fast")).unwrap_err();
        assert_eq!(err.retry_after, 30);
    }

    #[test]
    fn test_metrics_recorded_per_decision() {
        let shield = default_shield();
        shield.set_route_limit("/a", 2, None, None).unwrap();
        for _ in 0..5 {
            shield.admit("c", Some("/a"));
        }

        let global = shield.get_global_stats();
        assert_eq!(global.total_requests, 5);
        assert_eq!(global.allowed_requests, 2);
        assert_eq!(global.rejected_requests, 3);

        let route = shield.get_route_stats("/a");
        assert!(route.exists);
        assert_eq!(route.policy.unwrap().limit, 2);
        let frame = route.metrics.unwrap();
        assert_eq!(frame.total_requests, 5);
        assert_eq!(
            frame.total_requests,
            frame.allowed_requests + frame.rejected_requests
        );

        let client = shield.get_client_stats("c");
        assert!(client.exists);
        assert_eq!(client.total_requests, 5);
        assert!((client.rejection_rate - 0.6).abs() < 1e-9);
        assert!(client.avg_latency_ms.is_some());
    }

    #[test]
    fn test_unknown_scopes_report_not_existing() {
        let shield = default_shield();
        assert!(!shield.get_route_stats("/nope").exists);
        assert!(!shield.get_client_stats("ghost").exists);
    }

    #[test]
    fn test_reset_client_restores_budget_and_clears_stats() {
        let shield = default_shield();
        shield.set_client_limit("c", 1, None, None).unwrap();
        assert!(shield.admit("c", None));
        assert!(!shield.admit("c", None));

        shield.reset_client("c");

        assert_eq!(shield.get_client_stats("c").total_requests, 0);
        assert!(shield.admit("c", None));
    }

    #[test]
    fn test_reset_client_unknown_is_noop() {
        let shield = default_shield();
        shield.reset_client("ghost");
    }

    #[test]
    fn test_reset_statistics() {
        let shield = default_shield();
        shield.admit("c", Some("/a"));
        shield.reset_statistics();
        assert_eq!(shield.get_global_stats().total_requests, 0);
        assert!(!shield.get_route_stats("/a").exists);
    }

    #[test]
    fn test_key_stats_follow_resolution() {
        let shield = manual_shield(ShieldConfig {
            default_limit: 10,
            ..ShieldConfig::default()
        });
        assert!(shield.key_stats("c", Some("/a")).is_none());
        shield.admit("c", Some("/a"));
        match shield.key_stats("c", Some("/a")) {
            Some(KeyStats::TokenBucket { tokens, .. }) => assert!(tokens < 10.0),
            other => panic!("unexpected stats: {:?}", other),
        }
    }

    struct FaultyLimiter;

    impl KeyedLimiter for FaultyLimiter {
        fn try_admit(&self, _key: &str, _now: f64) -> bool {
            panic!("injected fault")
        }
        fn reset(&self, _key: &str) {}
        fn stats(&self, _key: &str, _now: f64) -> Option<KeyStats> {
            None
        }
        fn reset_client(&self, _client_id: &str) {}
        fn evict_idle(&self, _horizon: f64) {
            panic!("injected fault")
        }
    }

    #[test]
    fn test_algorithm_fault_fails_open() {
        let shield = default_shield();
        shield.inner.registry.insert(
            InstanceKey {
                kind: AlgorithmKind::TokenBucket,
                limit: 100,
                window: 60,
            },
            Arc::new(FaultyLimiter),
        );

        // A broken limiter must never take the service down.
        assert!(shield.admit("c", Some("/a")));
        let global = shield.get_global_stats();
        assert_eq!(global.total_requests, 1);
        assert_eq!(global.allowed_requests, 1);
    }

    #[test]
    fn test_monitor_tick_adapts_route_limit_up() {
        let shield = default_shield();
        shield.set_route_limit("/a", 50, Some(60), None).unwrap();

        // Two clients each burn a 50-token budget with 65 requests:
        // 130 total, 30 rejected, rejection rate ~23%.
        for client in ["c1", "c2"] {
            for _ in 0..65 {
                shield.admit(client, Some("/a"));
            }
        }

        monitor::tick(&shield);

        let policy = shield.get_route_stats("/a").policy.unwrap();
        assert_eq!(policy.limit, 55);
        assert_eq!(policy.window, 60);
        assert_eq!(policy.kind, AlgorithmKind::TokenBucket);
    }

    #[test]
    fn test_monitor_tick_relaxes_idle_route_limit() {
        let shield = manual_shield(ShieldConfig {
            default_limit: 100,
            ..ShieldConfig::default()
        });
        shield.set_route_limit("/a", 400, Some(60), None).unwrap();

        // Plenty of traffic, nothing rejected: decay toward the default.
        for i in 0..120 {
            shield.admit(&format!("c{}", i % 4), Some("/a"));
        }

        monitor::tick(&shield);
        assert_eq!(shield.get_route_stats("/a").policy.unwrap().limit, 380);

        // Repeated ticks keep decaying but never cross the default floor.
        for _ in 0..100 {
            monitor::tick(&shield);
        }
        assert_eq!(shield.get_route_stats("/a").policy.unwrap().limit, 100);
    }

    #[test]
    fn test_monitor_tick_adapts_client_limit() {
        let shield = default_shield();
        shield.set_client_limit("c", 100, Some(60), None).unwrap();

        // The shared client budget admits 100 of 130: rejection rate ~0.23,
        // inside the (0.2, 0.4) raise band.
        for _ in 0..130 {
            shield.admit("c", Some("/a"));
        }
        monitor::tick(&shield);

        let policy = shield.get_client_stats("c").policy.unwrap();
        assert_eq!(policy.limit, 110);
        assert_eq!(policy.window, 60);
    }

    #[test]
    fn test_rejection_rate_outside_band_leaves_client_limit() {
        let shield = default_shield();
        shield.set_client_limit("c", 50, Some(60), None).unwrap();

        // 50 admitted, 80 rejected: rate ~0.62, outside every band.
        for _ in 0..130 {
            shield.admit("c", Some("/a"));
        }
        monitor::tick(&shield);
        assert_eq!(shield.get_client_stats("c").policy.unwrap().limit, 50);
    }

    #[test]
    fn test_adaptive_window_policies_exempt_from_adaptation() {
        let shield = default_shield();
        shield
            .set_route_limit("/a", 50, Some(60), Some(AlgorithmKind::AdaptiveWindow))
            .unwrap();

        for client in ["c1", "c2"] {
            for _ in 0..65 {
                shield.admit(client, Some("/a"));
            }
        }
        monitor::tick(&shield);

        // The per-key adaptive algorithm manages itself; the monitor leaves
        // its policy alone.
        assert_eq!(shield.get_route_stats("/a").policy.unwrap().limit, 50);
    }

    #[test]
    fn test_auto_adapt_off_leaves_policies_alone() {
        let shield = manual_shield(ShieldConfig {
            auto_adapt: false,
            ..ShieldConfig::default()
        });
        shield.set_route_limit("/a", 50, Some(60), None).unwrap();
        for client in ["c1", "c2"] {
            for _ in 0..65 {
                shield.admit(client, Some("/a"));
            }
        }
        monitor::tick(&shield);
        assert_eq!(shield.get_route_stats("/a").policy.unwrap().limit, 50);
    }

    #[test]
    fn test_monitor_survives_faulty_tick() {
        let shield = default_shield();
        shield.inner.registry.insert(
            InstanceKey {
                kind: AlgorithmKind::TokenBucket,
                limit: 100,
                window: 60,
            },
            Arc::new(FaultyLimiter),
        );
        shield.admit("c", Some("/a"));

        // The eviction walk panics inside the faulty instance; the guarded
        // tick logs and returns, and later ticks still run.
        monitor::tick_guarded(&shield);
        monitor::tick_guarded(&shield);
        assert_eq!(shield.get_global_stats().total_requests, 1);
    }
}
