use crate::policy::AlgorithmKind;
use serde::{Deserialize, Serialize};

/// Top-level shield configuration.
///
/// Every field has a default, so a shield can be built with zero
/// configuration: `ShieldConfig::default()` is 100 requests per 60 seconds
/// through a token bucket, with a 30-second monitor and one hour of metric
/// retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShieldConfig {
    #[serde(default = "default_limit")]
    pub default_limit: u32,

    /// Default window in seconds.
    #[serde(default = "default_window")]
    pub default_window: u32,

    #[serde(default = "default_kind")]
    pub default_kind: AlgorithmKind,

    /// How often the monitor runs retention, derived-metric refresh and
    /// adaptation (seconds). 0 disables the monitor entirely.
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,

    /// How long idle metric frames and idle per-key state are kept
    /// (seconds). Must be at least the monitor interval.
    #[serde(default = "default_metrics_retention")]
    pub metrics_retention_secs: u64,

    /// Whether the monitor rewrites route/client limits in response to
    /// observed rejection rates.
    #[serde(default = "default_auto_adapt")]
    pub auto_adapt: bool,

    /// Route policies applied at construction.
    #[serde(default)]
    pub routes: Vec<RoutePolicyConfig>,

    /// Client policies applied at construction.
    #[serde(default)]
    pub clients: Vec<ClientPolicyConfig>,

    /// Client-route policies applied at construction.
    #[serde(default)]
    pub client_routes: Vec<ClientRoutePolicyConfig>,
}

impl Default for ShieldConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            default_window: default_window(),
            default_kind: default_kind(),
            monitor_interval_secs: default_monitor_interval(),
            metrics_retention_secs: default_metrics_retention(),
            auto_adapt: default_auto_adapt(),
            routes: Vec::new(),
            clients: Vec::new(),
            client_routes: Vec::new(),
        }
    }
}

fn default_limit() -> u32 {
    100
}

fn default_window() -> u32 {
    60
}

fn default_kind() -> AlgorithmKind {
    AlgorithmKind::TokenBucket
}

fn default_monitor_interval() -> u64 {
    30
}

fn default_metrics_retention() -> u64 {
    3600
}

fn default_auto_adapt() -> bool {
    true
}

/// A route-scoped policy. A missing `window` or `kind` falls back to the
/// shield defaults when applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePolicyConfig {
    /// Exact route, or a prefix pattern with a trailing `*`.
    pub route: String,

    pub limit: u32,

    #[serde(default)]
    pub window: Option<u32>,

    #[serde(default)]
    pub kind: Option<AlgorithmKind>,
}

/// A client-scoped policy. A missing `kind` keeps inheriting the shield
/// default at resolve time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientPolicyConfig {
    pub client_id: String,

    pub limit: u32,

    #[serde(default)]
    pub window: Option<u32>,

    #[serde(default)]
    pub kind: Option<AlgorithmKind>,
}

/// A policy for one specific (client, route) pair, the most specific scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRoutePolicyConfig {
    pub client_id: String,

    pub route: String,

    pub limit: u32,

    #[serde(default)]
    pub window: Option<u32>,

    #[serde(default)]
    pub kind: Option<AlgorithmKind>,
}
