use super::Shield;
use crate::clock;
use crate::policy::{AlgorithmKind, Policy};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Routes and clients need at least this many recorded requests before the
/// monitor will touch their limit.
const MIN_ADAPT_SAMPLE: u64 = 100;
/// Rejection-rate band that triggers a 10% limit raise. Above the band the
/// caller is considered abusive and gets no relief.
const RAISE_BAND: (f64, f64) = (0.2, 0.4);
/// Below this rejection rate an elevated limit decays back toward the
/// default.
const RELAX_BELOW: f64 = 0.05;

/// Background monitor loop: one pass every `interval_secs`, stopping
/// promptly on cancellation. No lock is held across the sleep, and a
/// panicking pass never kills the loop.
pub(super) async fn run(shield: Shield, interval_secs: u64, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; consume it so the first real
    // pass happens one interval after startup.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => tick_guarded(&shield),
        }
    }
    debug!("monitor: stopped");
}

/// One fault-isolated monitor pass.
pub(super) fn tick_guarded(shield: &Shield) {
    if catch_unwind(AssertUnwindSafe(|| tick(shield))).is_err() {
        error!("monitor: pass failed, continuing on next tick");
    }
    metrics::counter!("shield_monitor_ticks_total").increment(1);
}

/// One monitor pass: retention sweeps, derived-metric refresh, then route
/// and client adaptation. Metric views are snapshotted into plain values
/// before any policy is touched.
pub(super) fn tick(shield: &Shield) {
    let inner = &shield.inner;
    let now = clock::now();

    // 1. Retention: stale metric frames and idle per-key algorithm state.
    let horizon = now - inner.metrics_retention_secs as f64;
    let evicted = inner.metrics.sweep(horizon);
    if evicted > 0 {
        debug!("monitor: evicted {} stale metric frames", evicted);
        metrics::counter!("shield_frames_evicted_total").increment(evicted as u64);
    }
    inner.registry.evict_idle(horizon);
    metrics::gauge!("shield_algorithm_instances").set(inner.registry.len() as f64);

    // 2. Derived values.
    let global = inner.metrics.global_snapshot(now);
    info!(
        "monitor: clients={}, routes={}, requests={}, rps={:.1}, block_rate={:.1}%",
        global.client_count,
        global.route_count,
        global.total_requests,
        global.requests_per_second,
        global.rejection_rate * 100.0
    );
    if global.rejection_rate > 0.3 && global.total_requests > 10 {
        warn!(
            "monitor: high block rate: {:.1}%",
            global.rejection_rate * 100.0
        );
    }

    // 3 + 4. Adaptation.
    if inner.auto_adapt {
        adapt_routes(shield);
        adapt_clients(shield);
    }
}

fn adapt_routes(shield: &Shield) {
    let inner = &shield.inner;
    for (route, policy) in inner.policies.routes() {
        // The adaptive-window algorithm already adapts per key.
        if policy.kind == AlgorithmKind::AdaptiveWindow {
            continue;
        }
        let Some((total, rejected)) = inner.metrics.route_totals(&route) else {
            continue;
        };
        if total < MIN_ADAPT_SAMPLE {
            continue;
        }
        let rejection_rate = rejected as f64 / total as f64;

        if let Some(new_limit) = adjusted_limit(policy.limit, rejection_rate, inner.default_limit) {
            let direction = if new_limit > policy.limit {
                "increase"
            } else {
                "decrease"
            };
            inner.policies.set_route_policy(
                &route,
                Policy {
                    limit: new_limit,
                    ..policy
                },
            );
            info!(
                "monitor: adaptive {}, route={}, limit {} -> {}, block_rate={:.1}%",
                direction,
                route,
                policy.limit,
                new_limit,
                rejection_rate * 100.0
            );
            metrics::counter!("shield_policy_adaptations_total", "direction" => direction)
                .increment(1);
        }
    }
}

fn adapt_clients(shield: &Shield) {
    let inner = &shield.inner;
    for (client_id, scoped) in inner.policies.clients() {
        if scoped.kind.unwrap_or(inner.default_kind) == AlgorithmKind::AdaptiveWindow {
            continue;
        }
        let Some((total, rejected)) = inner.metrics.client_totals(&client_id) else {
            continue;
        };
        if total < MIN_ADAPT_SAMPLE {
            continue;
        }
        let rejection_rate = rejected as f64 / total as f64;

        if let Some(new_limit) = adjusted_limit(scoped.limit, rejection_rate, inner.default_limit) {
            let direction = if new_limit > scoped.limit {
                "increase"
            } else {
                "decrease"
            };
            inner.policies.set_client_policy(
                &client_id,
                crate::policy::ScopedLimit {
                    limit: new_limit,
                    ..scoped
                },
            );
            info!(
                "monitor: adaptive {}, client={}, limit {} -> {}, block_rate={:.1}%",
                direction,
                client_id,
                scoped.limit,
                new_limit,
                rejection_rate * 100.0
            );
            metrics::counter!("shield_policy_adaptations_total", "direction" => direction)
                .increment(1);
        }
    }
}

/// The adaptation rule shared by route and client scopes: a moderate
/// rejection rate raises the limit by 10% (rounded down); a near-zero rate
/// decays an elevated limit by 5% toward the default floor. Returns `None`
/// when the limit should not change.
fn adjusted_limit(limit: u32, rejection_rate: f64, default_limit: u32) -> Option<u32> {
    if rejection_rate > RAISE_BAND.0 && rejection_rate < RAISE_BAND.1 {
        let new_limit = (f64::from(limit) * 1.1) as u32;
        (new_limit > limit).then_some(new_limit)
    } else if rejection_rate < RELAX_BELOW && limit > default_limit {
        let new_limit = default_limit.max((f64::from(limit) * 0.95) as u32);
        (new_limit < limit).then_some(new_limit)
    } else {
        None
    }
}
