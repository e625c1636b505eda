//! Token bucket rate limiting.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::{Acquire, RateLimiter};

/// Mutable bucket state, guarded by the instance mutex.
#[derive(Debug)]
struct BucketState {
    /// Current token count, always `<= capacity`.
    tokens: f64,
    /// Clock reading of the last refill.
    last_refill: Instant,
}

/// Token bucket limiter: capacity `C`, refill rate `R` tokens/sec.
///
/// Admits bursts of up to `C` from a full bucket, then enforces the
/// average rate `R`. `retry_after` reports the time until enough tokens
/// accumulate for the requested cost.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket.
    ///
    /// A non-positive refill rate is clamped to a small epsilon so that
    /// `retry_after` stays finite.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        let capacity = f64::from(capacity);
        Self {
            capacity,
            refill_per_sec: refill_per_sec.max(f64::EPSILON),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Create a full bucket with an explicit refill origin, for
    /// deterministic tests.
    pub fn with_origin(capacity: u32, refill_per_sec: f64, origin: Instant) -> Self {
        let bucket = Self::new(capacity, refill_per_sec);
        bucket.state.lock().last_refill = origin;
        bucket
    }
}

impl RateLimiter for TokenBucket {
    fn try_acquire_at(&self, cost: u32, now: Instant) -> Acquire {
        let cost = f64::from(cost);
        let mut state = self.state.lock();

        // Refill first, capped at capacity. A clock that did not advance
        // contributes zero.
        let elapsed = now.saturating_duration_since(state.last_refill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.refill_per_sec)
            .min(self.capacity);
        state.last_refill = now;

        if cost > self.capacity {
            return Acquire::oversized(state.tokens as u64);
        }

        if state.tokens >= cost {
            state.tokens -= cost;
            Acquire::admitted(state.tokens as u64)
        } else {
            let deficit = cost - state.tokens;
            let retry_after = Duration::from_secs_f64(deficit / self.refill_per_sec);
            Acquire::denied(state.tokens as u64, retry_after)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_of_capacity_succeeds_from_full_bucket() {
        let origin = Instant::now();
        let bucket = TokenBucket::with_origin(5, 1.0, origin);

        for i in 0..5 {
            let result = bucket.try_acquire_at(1, origin);
            assert!(result.allowed, "request {} should be admitted", i + 1);
        }

        let denied = bucket.try_acquire_at(1, origin);
        assert!(!denied.allowed);
        assert!(!denied.oversized);
        assert!(denied.retry_after > Duration::ZERO);
    }

    #[test]
    fn retry_after_estimates_refill_time() {
        let origin = Instant::now();
        let bucket = TokenBucket::with_origin(2, 2.0, origin);

        assert!(bucket.try_acquire_at(2, origin).allowed);
        let denied = bucket.try_acquire_at(1, origin);
        // 1 token at 2 tokens/sec => 500ms.
        assert_eq!(denied.retry_after, Duration::from_millis(500));

        // Waiting the reported duration admits the request.
        let later = origin + denied.retry_after;
        assert!(bucket.try_acquire_at(1, later).allowed);
    }

    #[test]
    fn refill_is_capped_at_capacity() {
        let origin = Instant::now();
        let bucket = TokenBucket::with_origin(3, 10.0, origin);

        // Long idle period must not overfill the bucket.
        let later = origin + Duration::from_secs(3600);
        assert!(bucket.try_acquire_at(3, later).allowed);
        assert!(!bucket.try_acquire_at(1, later).allowed);
    }

    #[test]
    fn oversized_cost_is_always_rejected() {
        let origin = Instant::now();
        let bucket = TokenBucket::with_origin(5, 1.0, origin);

        let result = bucket.try_acquire_at(6, origin);
        assert!(!result.allowed);
        assert!(result.oversized);
        assert_eq!(result.retry_after, Duration::ZERO);

        // A full bucket later still rejects it.
        let later = origin + Duration::from_secs(100);
        assert!(bucket.try_acquire_at(6, later).oversized);
    }

    #[test]
    fn average_rate_is_enforced_after_burst() {
        let origin = Instant::now();
        let bucket = TokenBucket::with_origin(5, 5.0 / 60.0, origin);

        // Capacity 5, refill 5/min: six requests inside one second admit
        // exactly the burst allowance.
        let mut admitted = 0;
        for i in 0..6 {
            let at = origin + Duration::from_millis(i * 150);
            if bucket.try_acquire_at(1, at).allowed {
                admitted += 1;
            } else {
                let denied = bucket.try_acquire_at(1, at);
                assert!(denied.retry_after > Duration::ZERO);
            }
        }
        assert_eq!(admitted, 5);
    }
}
