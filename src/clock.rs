use std::sync::OnceLock;
use std::time::Instant;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Monotonic seconds since the process-wide epoch (first call).
///
/// This is the only time source in the crate. Millisecond precision is
/// sufficient for every consumer; `f64` keeps the arithmetic in the
/// algorithms exact over any realistic process lifetime.
pub fn now() -> f64 {
    epoch().elapsed().as_secs_f64()
}

/// Same instant as [`now`], in microseconds. Used for the lock-free
/// last-access stamps on per-key state.
pub fn now_micros() -> u64 {
    epoch().elapsed().as_micros() as u64
}

/// Convert a [`now`]-scale value to the micros scale of [`now_micros`].
pub fn to_micros(secs: f64) -> u64 {
    if secs <= 0.0 {
        return 0;
    }
    (secs * 1_000_000.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic() {
        let a = now();
        let b = now();
        assert!(b >= a);
    }

    #[test]
    fn test_micros_tracks_secs() {
        let s = now();
        let us = now_micros();
        // Both read the same epoch; they agree to within a few millis.
        assert!((us as f64 / 1_000_000.0 - s).abs() < 0.01);
    }

    #[test]
    fn test_to_micros_clamps_negative() {
        assert_eq!(to_micros(-1.0), 0);
        assert_eq!(to_micros(1.5), 1_500_000);
    }
}
