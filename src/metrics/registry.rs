use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for decision latency (seconds). Admission
/// decisions are microsecond-class; the tail buckets catch contention.
const DECISION_BUCKETS: &[f64] = &[
    0.000_005, 0.000_01, 0.000_025, 0.000_05, 0.000_1, 0.000_25, 0.000_5, 0.001, 0.005, 0.01,
];

/// Thin handle around the global metrics recorder.
///
/// After `Telemetry::install()` the `metrics` crate macros (`counter!`,
/// `histogram!`) emitted on the admission path are collected by the
/// Prometheus recorder. The `PrometheusHandle` is retained solely so the
/// embedding application can render an exposition endpoint. Installing is
/// optional: without it the macros are no-ops.
#[derive(Clone)]
pub struct Telemetry {
    handle: PrometheusHandle,
}

impl Telemetry {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Must be called **once** per process, before traffic.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Full(
                    "shield_decision_duration_seconds".to_string(),
                ),
                DECISION_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        describe_counter!(
            "shield_requests_total",
            Unit::Count,
            "Total admission decisions made"
        );
        describe_counter!(
            "shield_admitted_total",
            Unit::Count,
            "Requests admitted, by route"
        );
        describe_counter!(
            "shield_rejected_total",
            Unit::Count,
            "Requests rejected, by route"
        );
        describe_histogram!(
            "shield_decision_duration_seconds",
            Unit::Seconds,
            "Admission decision latency"
        );
        describe_counter!(
            "shield_limiter_failures_total",
            Unit::Count,
            "Algorithm faults that failed open"
        );
        describe_counter!(
            "shield_policy_adaptations_total",
            Unit::Count,
            "Automatic policy limit adjustments, by direction"
        );
        describe_counter!(
            "shield_frames_evicted_total",
            Unit::Count,
            "Metric frames dropped by retention sweeps"
        );
        describe_counter!(
            "shield_monitor_ticks_total",
            Unit::Count,
            "Completed monitor ticks"
        );
        describe_gauge!(
            "shield_algorithm_instances",
            Unit::Count,
            "Live algorithm instances"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
