pub mod registry;

pub use registry::Telemetry;

use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Latencies retained per route / client-route frame.
const SCOPED_LATENCY_RING: usize = 100;
/// Latencies retained globally.
const GLOBAL_LATENCY_RING: usize = 1000;

/// One scope's counters plus a bounded ring of recent decision latencies.
/// `total == allowed + rejected` after every record.
#[derive(Debug, Clone)]
struct Frame {
    total: u64,
    allowed: u64,
    rejected: u64,
    first_seen: f64,
    last_seen: f64,
    latencies: VecDeque<f64>,
    ring: usize,
}

impl Frame {
    fn new(now: f64, ring: usize) -> Self {
        Self {
            total: 0,
            allowed: 0,
            rejected: 0,
            first_seen: now,
            last_seen: now,
            latencies: VecDeque::with_capacity(ring.min(128)),
            ring,
        }
    }

    fn record(&mut self, admitted: bool, latency_ms: f64, now: f64) {
        self.total += 1;
        if admitted {
            self.allowed += 1;
        } else {
            self.rejected += 1;
        }
        self.last_seen = now;
        if self.latencies.len() == self.ring {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency_ms);
    }

    fn rejection_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.rejected as f64 / self.total as f64
        }
    }

    fn avg_latency_ms(&self) -> Option<f64> {
        if self.latencies.is_empty() {
            return None;
        }
        Some(self.latencies.iter().sum::<f64>() / self.latencies.len() as f64)
    }

    fn snapshot(&self) -> FrameSnapshot {
        FrameSnapshot {
            total_requests: self.total,
            allowed_requests: self.allowed,
            rejected_requests: self.rejected,
            rejection_rate: self.rejection_rate(),
            first_request: self.first_seen,
            last_request: self.last_seen,
            avg_latency_ms: self.avg_latency_ms(),
        }
    }
}

/// Serializable view of one frame.
#[derive(Debug, Clone, Serialize)]
pub struct FrameSnapshot {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub rejected_requests: u64,
    pub rejection_rate: f64,
    pub first_request: f64,
    pub last_request: f64,
    pub avg_latency_ms: Option<f64>,
}

/// Serializable global view with derived rates.
#[derive(Debug, Clone, Serialize)]
pub struct GlobalStats {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub rejected_requests: u64,
    pub rejection_rate: f64,
    pub requests_per_second: f64,
    pub uptime: f64,
    pub client_count: usize,
    pub route_count: usize,
    pub avg_latency_ms: Option<f64>,
}

struct GlobalFrame {
    frame: Frame,
    observed_since: f64,
}

/// Decision counters at three scopes: global, per-route, and
/// per-(client, route). Frames are created on first use, updated on every
/// decision, and evicted by the monitor's retention sweep once idle.
pub struct MetricsStore {
    global: Mutex<GlobalFrame>,
    routes: DashMap<String, Arc<Mutex<Frame>>>,
    /// client -> route -> frame. Requests with no route are tracked under
    /// the empty-string route within their client scope.
    clients: DashMap<String, DashMap<String, Arc<Mutex<Frame>>>>,
}

impl MetricsStore {
    pub fn new(now: f64) -> Self {
        Self {
            global: Mutex::new(GlobalFrame {
                frame: Frame::new(now, GLOBAL_LATENCY_RING),
                observed_since: now,
            }),
            routes: DashMap::new(),
            clients: DashMap::new(),
        }
    }

    pub fn record(
        &self,
        client_id: &str,
        route: Option<&str>,
        admitted: bool,
        latency_ms: f64,
        now: f64,
    ) {
        {
            let mut global = self.global.lock().unwrap();
            global.frame.record(admitted, latency_ms, now);
        }

        if let Some(route) = route {
            let frame = self.route_frame(route, now);
            frame.lock().unwrap().record(admitted, latency_ms, now);
        }

        let frame = self.client_route_frame(client_id, route.unwrap_or(""), now);
        frame.lock().unwrap().record(admitted, latency_ms, now);
    }

    /// Evict route and client-route frames whose last decision predates
    /// `horizon`. Frames seen within the horizon are never removed. Returns
    /// how many frames were dropped.
    pub fn sweep(&self, horizon: f64) -> usize {
        let mut evicted = 0;

        self.routes.retain(|_, frame| {
            let keep = frame.lock().unwrap().last_seen >= horizon;
            if !keep {
                evicted += 1;
            }
            keep
        });

        self.clients.retain(|_, routes| {
            routes.retain(|_, frame| {
                let keep = frame.lock().unwrap().last_seen >= horizon;
                if !keep {
                    evicted += 1;
                }
                keep
            });
            !routes.is_empty()
        });

        evicted
    }

    /// Zero every frame and restart the global observation window.
    pub fn reset(&self, now: f64) {
        let mut global = self.global.lock().unwrap();
        global.frame = Frame::new(now, GLOBAL_LATENCY_RING);
        global.observed_since = now;
        drop(global);
        self.routes.clear();
        self.clients.clear();
    }

    pub fn remove_client(&self, client_id: &str) {
        self.clients.remove(client_id);
    }

    pub fn global_snapshot(&self, now: f64) -> GlobalStats {
        let global = self.global.lock().unwrap();
        let elapsed = (now - global.observed_since).max(0.0);
        GlobalStats {
            total_requests: global.frame.total,
            allowed_requests: global.frame.allowed,
            rejected_requests: global.frame.rejected,
            rejection_rate: global.frame.rejection_rate(),
            requests_per_second: if elapsed > 0.0 {
                global.frame.total as f64 / elapsed
            } else {
                0.0
            },
            uptime: elapsed,
            client_count: self.clients.len(),
            route_count: self.routes.len(),
            avg_latency_ms: global.frame.avg_latency_ms(),
        }
    }

    pub fn route_snapshot(&self, route: &str) -> Option<FrameSnapshot> {
        self.routes
            .get(route)
            .map(|frame| frame.lock().unwrap().snapshot())
    }

    /// `(total, rejected)` for one route, for the adaptation pass.
    pub fn route_totals(&self, route: &str) -> Option<(u64, u64)> {
        self.routes.get(route).map(|frame| {
            let frame = frame.lock().unwrap();
            (frame.total, frame.rejected)
        })
    }

    /// `(total, rejected)` aggregated over every route of one client.
    pub fn client_totals(&self, client_id: &str) -> Option<(u64, u64)> {
        self.clients.get(client_id).map(|routes| {
            let mut total = 0;
            let mut rejected = 0;
            for frame in routes.iter() {
                let frame = frame.lock().unwrap();
                total += frame.total;
                rejected += frame.rejected;
            }
            (total, rejected)
        })
    }

    /// Mean decision latency over every ring the client still has frames
    /// for. `None` when the client is unknown or has no samples.
    pub fn client_latency_avg(&self, client_id: &str) -> Option<f64> {
        let routes = self.clients.get(client_id)?;
        let mut sum = 0.0;
        let mut samples = 0usize;
        for frame in routes.iter() {
            let frame = frame.lock().unwrap();
            sum += frame.latencies.iter().sum::<f64>();
            samples += frame.latencies.len();
        }
        (samples > 0).then(|| sum / samples as f64)
    }

    /// Per-route snapshots for one client, plus the aggregate frame view.
    pub fn client_snapshot(
        &self,
        client_id: &str,
    ) -> Option<std::collections::HashMap<String, FrameSnapshot>> {
        self.clients.get(client_id).map(|routes| {
            routes
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().lock().unwrap().snapshot()))
                .collect()
        })
    }

    fn route_frame(&self, route: &str, now: f64) -> Arc<Mutex<Frame>> {
        if let Some(frame) = self.routes.get(route) {
            return frame.value().clone();
        }
        self.routes
            .entry(route.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Frame::new(now, SCOPED_LATENCY_RING))))
            .clone()
    }

    fn client_route_frame(&self, client_id: &str, route: &str, now: f64) -> Arc<Mutex<Frame>> {
        let routes = match self.clients.get(client_id) {
            Some(routes) => routes,
            None => self
                .clients
                .entry(client_id.to_string())
                .or_default()
                .downgrade(),
        };
        if let Some(frame) = routes.get(route) {
            return frame.value().clone();
        }
        let frame = routes
            .entry(route.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Frame::new(now, SCOPED_LATENCY_RING))))
            .clone();
        frame
    }
}
