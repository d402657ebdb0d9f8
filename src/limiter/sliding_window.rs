use super::{KeyStats, KeyTable, KeyedLimiter};
use std::collections::HashMap;

/// Sliding-window counter: the window is divided into
/// `precision = min(window, 60)` slices of `window / precision` seconds,
/// and each key counts admissions per slice. The decision sums the slices
/// still inside the window, so the window truly slides at slice
/// granularity. Per-key storage is bounded by `precision` slots.
pub struct SlidingWindow {
    limit: u32,
    precision: u64,
    slice: f64,
    keys: KeyTable<SlidingWindowState>,
}

struct SlidingWindowState {
    slices: HashMap<u64, u32>,
}

impl SlidingWindow {
    pub fn new(limit: u32, window: u32) -> Self {
        let precision = u64::from(window.min(60)).max(1);
        Self {
            limit,
            precision,
            slice: f64::from(window) / precision as f64,
            keys: KeyTable::new(),
        }
    }

    fn slice_index(&self, now: f64) -> u64 {
        (now.max(0.0) / self.slice) as u64
    }

    /// Drop slices that have fallen out of the window ending at `current`,
    /// returning the surviving count.
    fn prune(&self, state: &mut SlidingWindowState, current: u64) -> u32 {
        let window_start = current.saturating_sub(self.precision - 1);
        state.slices.retain(|&index, _| index >= window_start);
        state.slices.values().sum()
    }
}

impl KeyedLimiter for SlidingWindow {
    fn try_admit(&self, key: &str, now: f64) -> bool {
        let entry = self.keys.get_or_insert_with(key, || SlidingWindowState {
            slices: HashMap::new(),
        });
        entry.touch(now);

        let current = self.slice_index(now);
        let mut state = entry.state.lock().unwrap();
        let counter = self.prune(&mut state, current);
        if counter >= self.limit {
            false
        } else {
            *state.slices.entry(current).or_insert(0) += 1;
            true
        }
    }

    fn reset(&self, key: &str) {
        self.keys.remove(key);
    }

    fn stats(&self, key: &str, now: f64) -> Option<KeyStats> {
        let entry = self.keys.get(key)?;
        let current = self.slice_index(now);
        let mut state = entry.state.lock().unwrap();
        let counter = self.prune(&mut state, current);
        Some(KeyStats::SlidingWindow {
            current_count: counter,
            remaining: self.limit.saturating_sub(counter),
            utilization: f64::from(counter) / f64::from(self.limit),
        })
    }

    fn reset_client(&self, client_id: &str) {
        self.keys.reset_client(client_id);
    }

    fn evict_idle(&self, horizon: f64) {
        self.keys.evict_idle(horizon);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_slides_at_slice_granularity() {
        // limit=6, window=6s: precision=6, slice=1s.
        let sw = SlidingWindow::new(6, 6);

        for _ in 0..6 {
            assert!(sw.try_admit("c", 0.1));
        }
        // Same slice, window full.
        assert!(!sw.try_admit("c", 0.9));
        // Next slice, but slice 0 is still inside the 6-slice window.
        assert!(!sw.try_admit("c", 1.1));
        // Slice 0 has fallen out.
        assert!(sw.try_admit("c", 6.1));
    }

    #[test]
    fn test_slice_aligned_interval_never_exceeds_limit() {
        let sw = SlidingWindow::new(5, 10);
        let mut per_window = [0u32; 3];
        // Saturating caller for 30s; count admissions per aligned window.
        for i in 0..300 {
            let now = i as f64 * 0.1;
            if sw.try_admit("c", now) {
                per_window[(now / 10.0) as usize] += 1;
            }
        }
        for (w, &count) in per_window.iter().enumerate() {
            assert!(count <= 5, "window {} admitted {}", w, count);
        }
    }

    #[test]
    fn test_storage_bounded_by_precision() {
        let sw = SlidingWindow::new(1000, 4);
        // Spread admissions over many slices; pruning keeps at most
        // `precision` live slots.
        for i in 0..100 {
            sw.try_admit("c", i as f64);
        }
        let entry = sw.keys.get("c").unwrap();
        let state = entry.state.lock().unwrap();
        assert!(state.slices.len() <= 4);
    }

    #[test]
    fn test_short_window_precision() {
        // window=2 < 60: precision=2, slice=1s.
        let sw = SlidingWindow::new(2, 2);
        assert!(sw.try_admit("c", 0.0));
        assert!(sw.try_admit("c", 0.5));
        assert!(!sw.try_admit("c", 1.5));
        // Slice 0 expires at t=2.
        assert!(sw.try_admit("c", 2.0));
    }

    #[test]
    fn test_long_window_caps_precision_at_sixty() {
        // window=120: precision=60, slice=2s.
        let sw = SlidingWindow::new(3, 120);
        assert!(sw.try_admit("c", 0.0));
        assert!(sw.try_admit("c", 1.0));
        assert!(sw.try_admit("c", 2.0));
        assert!(!sw.try_admit("c", 100.0));
        // The t=0 and t=1 admissions share slice 0, which leaves the window
        // once the current slice index passes 59 + 0.
        assert!(sw.try_admit("c", 120.0));
    }

    #[test]
    fn test_reset_and_key_independence() {
        let sw = SlidingWindow::new(1, 6);
        assert!(sw.try_admit("a", 0.0));
        assert!(!sw.try_admit("a", 0.0));
        assert!(sw.try_admit("b", 0.0));
        sw.reset("a");
        assert!(sw.try_admit("a", 0.0));
    }

    #[test]
    fn test_stats() {
        let sw = SlidingWindow::new(4, 6);
        sw.try_admit("c", 0.0);
        sw.try_admit("c", 1.0);
        match sw.stats("c", 1.0) {
            Some(KeyStats::SlidingWindow {
                current_count,
                remaining,
                utilization,
            }) => {
                assert_eq!(current_count, 2);
                assert_eq!(remaining, 2);
                assert!((utilization - 0.5).abs() < 1e-9);
            }
            other => panic!("unexpected stats: {:?}", other),
        }
    }
}
