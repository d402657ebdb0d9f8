use super::{KeyStats, KeyTable, KeyedLimiter};
use std::collections::VecDeque;

const ADAPTATION_RATE: f64 = 0.1;
const THRESHOLD_HIGH: f64 = 0.8;
const THRESHOLD_LOW: f64 = 0.2;
/// Minimum observations between per-key adaptations.
const MIN_REQUESTS_TO_ADAPT: u32 = 10;

/// Adaptive window: a timestamp-list limiter whose effective limit and
/// window drift per key in response to that key's own allow ratio. A key
/// being rejected hard gets a gently wider budget; a key sailing through
/// gets squeezed. Bounds derived from the configured pair keep the drift
/// within `[limit/10, 2*limit]` and `[window/4, 2*window]`.
///
/// This per-key adaptation is independent of the shield-level route/client
/// adaptation; both may run at once.
pub struct AdaptiveWindow {
    base_limit: u32,
    base_window: u32,
    min_limit: f64,
    max_limit: f64,
    min_window: f64,
    max_window: f64,
    /// Seconds between per-key adaptations: a quarter of the base window.
    adapt_interval: f64,
    keys: KeyTable<AdaptiveWindowState>,
}

struct AdaptiveWindowState {
    eff_limit: f64,
    eff_window: f64,
    admits: VecDeque<f64>,
    requests_since_adapt: u32,
    allowed_since_adapt: u32,
    last_adapt: f64,
}

impl AdaptiveWindow {
    pub fn new(limit: u32, window: u32) -> Self {
        Self {
            base_limit: limit,
            base_window: window,
            min_limit: f64::from((limit / 10).max(1)),
            max_limit: f64::from(limit) * 2.0,
            min_window: f64::from((window / 4).max(1)),
            max_window: f64::from(window) * 2.0,
            adapt_interval: f64::from(window) / 4.0,
            keys: KeyTable::new(),
        }
    }

    fn adapt(&self, state: &mut AdaptiveWindowState, now: f64) {
        if now - state.last_adapt < self.adapt_interval
            || state.requests_since_adapt < MIN_REQUESTS_TO_ADAPT
        {
            return;
        }

        let allow_ratio =
            f64::from(state.allowed_since_adapt) / f64::from(state.requests_since_adapt);

        if allow_ratio < THRESHOLD_LOW {
            state.eff_limit = (state.eff_limit * (1.0 + ADAPTATION_RATE)).min(self.max_limit);
            state.eff_window = (state.eff_window * (1.0 + ADAPTATION_RATE)).min(self.max_window);
        } else if allow_ratio > THRESHOLD_HIGH {
            state.eff_limit = (state.eff_limit * (1.0 - ADAPTATION_RATE)).max(self.min_limit);
            state.eff_window = (state.eff_window * (1.0 - ADAPTATION_RATE)).max(self.min_window);
        }

        state.requests_since_adapt = 0;
        state.allowed_since_adapt = 0;
        state.last_adapt = now;
    }

    fn prune(state: &mut AdaptiveWindowState, now: f64) {
        let cutoff = now - state.eff_window;
        while let Some(&t) = state.admits.front() {
            if t <= cutoff {
                state.admits.pop_front();
            } else {
                break;
            }
        }
    }
}

impl KeyedLimiter for AdaptiveWindow {
    fn try_admit(&self, key: &str, now: f64) -> bool {
        let entry = self.keys.get_or_insert_with(key, || AdaptiveWindowState {
            eff_limit: f64::from(self.base_limit),
            eff_window: f64::from(self.base_window),
            admits: VecDeque::new(),
            requests_since_adapt: 0,
            allowed_since_adapt: 0,
            last_adapt: now,
        });
        entry.touch(now);

        let mut state = entry.state.lock().unwrap();
        self.adapt(&mut state, now);
        state.requests_since_adapt += 1;

        Self::prune(&mut state, now);
        if state.admits.len() as u64 >= state.eff_limit.floor() as u64 {
            false
        } else {
            state.admits.push_back(now);
            state.allowed_since_adapt += 1;
            true
        }
    }

    fn reset(&self, key: &str) {
        self.keys.remove(key);
    }

    fn stats(&self, key: &str, now: f64) -> Option<KeyStats> {
        let entry = self.keys.get(key)?;
        let mut state = entry.state.lock().unwrap();
        Self::prune(&mut state, now);
        let allow_ratio = if state.requests_since_adapt > 0 {
            f64::from(state.allowed_since_adapt) / f64::from(state.requests_since_adapt)
        } else {
            1.0
        };
        Some(KeyStats::AdaptiveWindow {
            effective_limit: state.eff_limit,
            effective_window: state.eff_window,
            current_count: state.admits.len() as u32,
            allow_ratio,
        })
    }

    fn reset_client(&self, client_id: &str) {
        self.keys.reset_client(client_id);
    }

    fn evict_idle(&self, horizon: f64) {
        self.keys.evict_idle(horizon);
    }
}
