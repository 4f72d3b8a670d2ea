//! Token bucket rate limiter
//!
//! Second-aligned token bucket shared by the per-metric value limit and the
//! per-shard new-metric limit. The bucket refills to the full limit at every
//! wall-clock second boundary; `is_allowed(n)` deducts `n` tokens only when
//! they are available. Lock-free: token consumption is a CAS loop and the
//! refill is a single compare-and-swap on the aligned second.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::clock::ClockFn;

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Second-aligned token bucket
pub struct RateLimiter {
    /// Tokens granted per wall-clock second
    limit_per_second: AtomicI64,
    /// Start of the second the bucket was last refilled for
    aligned_last_nanos: AtomicI64,
    /// Tokens remaining in the current second
    allowed: AtomicI64,
    clock: ClockFn,
}

impl RateLimiter {
    /// Create a limiter granting `limit_per_second` tokens each second
    ///
    /// The bucket starts full.
    pub fn new(limit_per_second: i64, clock: ClockFn) -> Self {
        let now = clock();
        Self {
            limit_per_second: AtomicI64::new(limit_per_second),
            aligned_last_nanos: AtomicI64::new(align_to_second(now)),
            allowed: AtomicI64::new(limit_per_second),
            clock,
        }
    }

    /// Current limit in tokens per second
    pub fn limit_per_second(&self) -> i64 {
        self.limit_per_second.load(Ordering::Relaxed)
    }

    /// Try to consume `n` tokens
    ///
    /// Returns true and deducts the tokens when available, false otherwise.
    pub fn is_allowed(&self, n: i64) -> bool {
        self.refill();

        loop {
            let current = self.allowed.load(Ordering::Relaxed);
            if current < n {
                return false;
            }
            match self.allowed.compare_exchange_weak(
                current,
                current - n,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(_) => continue,
            }
        }
    }

    /// Change the limit without dropping in-flight tokens
    ///
    /// Tokens already granted for the current second stay spendable; the new
    /// limit takes full effect at the next second boundary.
    pub fn reset(&self, new_limit_per_second: i64) {
        self.limit_per_second
            .store(new_limit_per_second, Ordering::Relaxed);
    }

    /// Refill the bucket when a second boundary has passed
    fn refill(&self) {
        let aligned_now = align_to_second((self.clock)());
        let aligned_last = self.aligned_last_nanos.load(Ordering::Relaxed);
        if aligned_now <= aligned_last {
            return;
        }
        // One thread wins the boundary crossing and restores the bucket.
        if self
            .aligned_last_nanos
            .compare_exchange(
                aligned_last,
                aligned_now,
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            self.allowed
                .store(self.limit_per_second.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }
}

fn align_to_second(nanos: i64) -> i64 {
    nanos - nanos.rem_euclid(NANOS_PER_SECOND)
}
