use crate::error::ShieldError;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::info;

/// The closed set of admission algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    TokenBucket,
    LeakyBucket,
    SlidingWindow,
    AdaptiveWindow,
}

impl AlgorithmKind {
    pub const ALL: [AlgorithmKind; 4] = [
        AlgorithmKind::TokenBucket,
        AlgorithmKind::LeakyBucket,
        AlgorithmKind::SlidingWindow,
        AlgorithmKind::AdaptiveWindow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlgorithmKind::TokenBucket => "token_bucket",
            AlgorithmKind::LeakyBucket => "leaky_bucket",
            AlgorithmKind::SlidingWindow => "sliding_window",
            AlgorithmKind::AdaptiveWindow => "adaptive_window",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ShieldError> {
        match s {
            "token_bucket" => Ok(AlgorithmKind::TokenBucket),
            "leaky_bucket" => Ok(AlgorithmKind::LeakyBucket),
            "sliding_window" => Ok(AlgorithmKind::SlidingWindow),
            "adaptive_window" => Ok(AlgorithmKind::AdaptiveWindow),
            other => Err(ShieldError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AlgorithmKind {
    type Err = ShieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// The `(limit, window, kind)` triple governing one admission scope.
/// `limit / window` is the steady-state admission rate in req/s.
///
/// Policies are immutable: reconfiguration and adaptation replace the whole
/// record, never mutate it in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub limit: u32,
    /// Window in whole seconds.
    pub window: u32,
    pub kind: AlgorithmKind,
}

impl Policy {
    pub fn new(limit: u32, window: u32, kind: AlgorithmKind) -> Result<Self, ShieldError> {
        if limit < 1 {
            return Err(ShieldError::InvalidLimit);
        }
        if window < 1 {
            return Err(ShieldError::InvalidWindow);
        }
        Ok(Self {
            limit,
            window,
            kind,
        })
    }
}

/// A client-scoped limit. A missing `kind` inherits the store default at
/// resolve time, so changing the default retroactively applies to every
/// client entry that never pinned one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScopedLimit {
    pub limit: u32,
    pub window: u32,
    pub kind: Option<AlgorithmKind>,
}

/// Which scope a resolved policy came from, most specific first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyScope {
    ClientRoute,
    Client,
    Route,
    Default,
}

#[derive(Debug, Clone, Copy)]
pub struct ResolvedPolicy {
    pub policy: Policy,
    pub scope: PolicyScope,
}

#[derive(Clone, Default)]
struct PolicyTable {
    by_route: HashMap<String, Policy>,
    by_client: HashMap<String, ScopedLimit>,
    by_client_route: HashMap<String, HashMap<String, ScopedLimit>>,
}

/// Stores and resolves admission policies for the four scopes with
/// precedence `(client, route) > client > route > default`.
///
/// Readers load an immutable snapshot via `ArcSwap` and never block; setters
/// serialize through a mutation mutex and publish a fresh snapshot, so a
/// concurrent `resolve` observes either the old or the new table, never a
/// half-updated one.
pub struct PolicyStore {
    default: Policy,
    table: ArcSwap<PolicyTable>,
    write_mu: Mutex<()>,
}

impl PolicyStore {
    pub fn new(default: Policy) -> Self {
        Self {
            default,
            table: ArcSwap::new(Arc::new(PolicyTable::default())),
            write_mu: Mutex::new(()),
        }
    }

    pub fn default_policy(&self) -> Policy {
        self.default
    }

    /// Return the most specific policy matching `(client, route)`.
    ///
    /// Route matching is exact first; a pattern with a trailing `*` matches
    /// as a prefix only after every exact candidate has failed, longest
    /// prefix winning.
    pub fn resolve(&self, client_id: &str, route: Option<&str>) -> ResolvedPolicy {
        let table = self.table.load();

        if let Some(route) = route {
            if let Some(scoped) = table
                .by_client_route
                .get(client_id)
                .and_then(|routes| routes.get(route))
            {
                return ResolvedPolicy {
                    policy: self.fill_kind(scoped),
                    scope: PolicyScope::ClientRoute,
                };
            }
        }

        if let Some(scoped) = table.by_client.get(client_id) {
            return ResolvedPolicy {
                policy: self.fill_kind(scoped),
                scope: PolicyScope::Client,
            };
        }

        if let Some(route) = route {
            if let Some(policy) = Self::match_route(&table, route) {
                return ResolvedPolicy {
                    policy,
                    scope: PolicyScope::Route,
                };
            }
        }

        ResolvedPolicy {
            policy: self.default,
            scope: PolicyScope::Default,
        }
    }

    pub fn set_route_policy(&self, route: &str, policy: Policy) {
        self.mutate(|table| {
            table.by_route.insert(route.to_string(), policy);
        });
        info!(
            "policy: route limit set, route={}, limit={}, window={}s, kind={}",
            route, policy.limit, policy.window, policy.kind
        );
    }

    pub fn set_client_policy(&self, client_id: &str, scoped: ScopedLimit) {
        self.mutate(|table| {
            table.by_client.insert(client_id.to_string(), scoped);
        });
        info!(
            "policy: client limit set, client={}, limit={}, window={}s, kind={}",
            client_id,
            scoped.limit,
            scoped.window,
            scoped.kind.map(|k| k.as_str()).unwrap_or("default")
        );
    }

    pub fn set_client_route_policy(&self, client_id: &str, route: &str, scoped: ScopedLimit) {
        self.mutate(|table| {
            table
                .by_client_route
                .entry(client_id.to_string())
                .or_default()
                .insert(route.to_string(), scoped);
        });
        info!(
            "policy: client-route limit set, client={}, route={}, limit={}, window={}s, kind={}",
            client_id,
            route,
            scoped.limit,
            scoped.window,
            scoped.kind.map(|k| k.as_str()).unwrap_or("default")
        );
    }

    /// Snapshot of the per-route policies, for the adaptation pass.
    pub fn routes(&self) -> Vec<(String, Policy)> {
        self.table
            .load()
            .by_route
            .iter()
            .map(|(route, policy)| (route.clone(), *policy))
            .collect()
    }

    pub fn route_policy(&self, route: &str) -> Option<Policy> {
        self.table.load().by_route.get(route).copied()
    }

    /// Snapshot of the per-client limits, for the adaptation pass.
    pub fn clients(&self) -> Vec<(String, ScopedLimit)> {
        self.table
            .load()
            .by_client
            .iter()
            .map(|(client, scoped)| (client.clone(), *scoped))
            .collect()
    }

    pub fn client_policy(&self, client_id: &str) -> Option<ScopedLimit> {
        self.table.load().by_client.get(client_id).copied()
    }

    pub fn client_route_policies(&self, client_id: &str) -> Vec<(String, ScopedLimit)> {
        self.table
            .load()
            .by_client_route
            .get(client_id)
            .map(|routes| {
                routes
                    .iter()
                    .map(|(route, scoped)| (route.clone(), *scoped))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn fill_kind(&self, scoped: &ScopedLimit) -> Policy {
        Policy {
            limit: scoped.limit,
            window: scoped.window,
            kind: scoped.kind.unwrap_or(self.default.kind),
        }
    }

    fn match_route(table: &PolicyTable, route: &str) -> Option<Policy> {
        if let Some(policy) = table.by_route.get(route) {
            return Some(*policy);
        }
        table
            .by_route
            .iter()
            .filter_map(|(pattern, policy)| {
                let prefix = pattern.strip_suffix('*')?;
                route.starts_with(prefix).then_some((prefix.len(), *policy))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, policy)| policy)
    }

    /// Copy-on-write mutation: clone the current table, apply, publish.
    fn mutate(&self, f: impl FnOnce(&mut PolicyTable)) {
        let _guard = self.write_mu.lock().unwrap();
        let mut table = (**self.table.load()).clone();
        f(&mut table);
        self.table.store(Arc::new(table));
    }
}
