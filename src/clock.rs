//! Clock abstraction
//!
//! All time-dependent components take a [`ClockFn`] rather than reading the
//! system clock directly, so rate limiting, expiration, and retry scheduling
//! are testable with a controlled clock.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Callable returning the current wall time in nanoseconds since the epoch
pub type ClockFn = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Clock backed by the system wall clock
pub fn system_clock() -> ClockFn {
    Arc::new(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0)
    })
}

/// Manually advanced clock for deterministic tests
///
/// Shares its current time through an atomic so clones handed to different
/// components observe the same advances.
#[derive(Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicI64>,
}

impl ManualClock {
    /// Create a clock starting at the given nanosecond timestamp
    pub fn new(start_nanos: i64) -> Self {
        Self {
            nanos: Arc::new(AtomicI64::new(start_nanos)),
        }
    }

    /// Current time in nanoseconds
    pub fn now_nanos(&self) -> i64 {
        self.nanos.load(Ordering::SeqCst)
    }

    /// Advance the clock by a duration
    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as i64, Ordering::SeqCst);
    }

    /// Set the clock to an absolute nanosecond timestamp
    pub fn set(&self, nanos: i64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }

    /// View this clock as a [`ClockFn`]
    pub fn as_fn(&self) -> ClockFn {
        let nanos = Arc::clone(&self.nanos);
        Arc::new(move || nanos.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_monotonic_enough() {
        let clock = system_clock();
        let a = clock();
        let b = clock();
        assert!(b >= a);
        assert!(a > 0);
    }

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(1_000);
        let as_fn = clock.as_fn();
        assert_eq!(as_fn(), 1_000);

        clock.advance(Duration::from_secs(2));
        assert_eq!(as_fn(), 1_000 + 2_000_000_000);

        clock.set(42);
        assert_eq!(clock.now_nanos(), 42);
        assert_eq!(as_fn(), 42);
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::new(0);
        let other = clock.clone();
        clock.advance(Duration::from_nanos(7));
        assert_eq!(other.now_nanos(), 7);
    }
}
