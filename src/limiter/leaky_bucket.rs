use super::{KeyStats, KeyTable, KeyedLimiter};

/// Leaky bucket: each admission adds one unit to the key's level, which
/// drains at `limit / window` units per second. A full bucket rejects.
///
/// Unlike the token bucket, accumulated idle time never buys a burst: once
/// the bucket has filled, admissions are paced at the leak rate.
pub struct LeakyBucket {
    capacity: f64,
    leak_rate: f64,
    keys: KeyTable<LeakyBucketState>,
}

struct LeakyBucketState {
    level: f64,
    last: f64,
}

impl LeakyBucket {
    pub fn new(limit: u32, window: u32) -> Self {
        Self {
            capacity: limit as f64,
            leak_rate: limit as f64 / window as f64,
            keys: KeyTable::new(),
        }
    }

    fn leak(&self, state: &mut LeakyBucketState, now: f64) {
        let elapsed = (now - state.last).max(0.0);
        state.level = (state.level - elapsed * self.leak_rate).max(0.0);
        state.last = state.last.max(now);
    }
}

impl KeyedLimiter for LeakyBucket {
    fn try_admit(&self, key: &str, now: f64) -> bool {
        let entry = self.keys.get_or_insert_with(key, || LeakyBucketState {
            level: 0.0,
            last: now,
        });
        entry.touch(now);

        let mut state = entry.state.lock().unwrap();
        self.leak(&mut state, now);
        if state.level >= self.capacity {
            false
        } else {
            state.level += 1.0;
            true
        }
    }

    fn reset(&self, key: &str) {
        self.keys.remove(key);
    }

    fn stats(&self, key: &str, now: f64) -> Option<KeyStats> {
        let entry = self.keys.get(key)?;
        let mut state = entry.state.lock().unwrap();
        self.leak(&mut state, now);
        let level = state.level;
        Some(KeyStats::LeakyBucket {
            level,
            leak_rate: self.leak_rate,
            time_to_empty: if level > 0.0 {
                level / self.leak_rate
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
