use super::{KeyStats, KeyTable, KeyedLimiter};

/// Token bucket: `capacity = limit` tokens, refilled at `limit / window`
/// tokens per second. Each admission consumes one token; the fractional
/// balance is retained on reject, so a sustained caller converges to
/// exactly the refill rate.
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    keys: KeyTable<TokenBucketState>,
}

struct TokenBucketState {
    tokens: f64,
    last: f64,
}

impl TokenBucket {
    pub fn new(limit: u32, window: u32) -> Self {
        Self {
            capacity: limit as f64,
            refill_rate: limit as f64 / window as f64,
            keys: KeyTable::new(),
        }
    }

    fn refill(&self, state: &mut TokenBucketState, now: f64) {
        let elapsed = (now - state.last).max(0.0);
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last = state.last.max(now);
    }
}

impl KeyedLimiter for TokenBucket {
    fn try_admit(&self, key: &str, now: f64) -> bool {
        let entry = self.keys.get_or_insert_with(key, || TokenBucketState {
            tokens: self.capacity,
            last: now,
        });
        entry.touch(now);

        let mut state = entry.state.lock().unwrap();
        self.refill(&mut state, now);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn reset(&self, key: &str) {
        self.keys.remove(key);
    }

    fn stats(&self, key: &str, now: f64) -> Option<KeyStats> {
        let entry = self.keys.get(key)?;
        let mut state = entry.state.lock().unwrap();
        self.refill(&mut state, now);
        let tokens = state.tokens;
        Some(KeyStats::TokenBucket {
            tokens,
            refill_rate: self.refill_rate,
            time_to_full: if tokens < self.capacity {
                (self.capacity - tokens) / self.refill_rate
            } else {
                0.0
            },
        })
    }

    fn reset_client(&self, client_id: &str) {
        self.keys.reset_client(client_id);
    }

    fn evict_idle(&self, horizon: f64) {
        self.keys.evict_idle(horizon);
    }
}
