//! Fixed window rate limiting.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::{Acquire, RateLimiter};

/// Counter state for the current window.
#[derive(Debug)]
struct WindowState {
    /// Index of the window the counter belongs to.
    index: u64,
    /// Admissions counted in that window.
    count: u32,
}

/// Fixed window limiter: at most `limit` admissions per aligned window.
///
/// Windows are aligned to a fixed epoch captured at construction; the
/// counter resets exactly when the clock crosses a window boundary. This
/// family of counters intentionally admits up to `2 * limit` requests in
/// a rolling window straddling a boundary (a full budget at the end of one
/// window plus a full budget at the start of the next). That burst is the
/// documented trade-off for O(1) state; callers needing the exact rolling
/// guarantee use [`crate::SlidingWindow`].
#[derive(Debug)]
pub struct FixedWindow {
    limit: u32,
    window: Duration,
    epoch: Instant,
    state: Mutex<WindowState>,
}

impl FixedWindow {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self::with_epoch(limit, window, Instant::now())
    }

    /// Create a limiter with an explicit epoch, for deterministic tests.
    pub fn with_epoch(limit: u32, window: Duration, epoch: Instant) -> Self {
        Self {
            limit,
            window,
            epoch,
            state: Mutex::new(WindowState { index: 0, count: 0 }),
        }
    }

    fn window_index(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.epoch);
        (elapsed.as_nanos() / self.window.as_nanos().max(1)) as u64
    }
}

impl RateLimiter for FixedWindow {
    fn try_acquire_at(&self, cost: u32, now: Instant) -> Acquire {
        let index = self.window_index(now);
        let mut state = self.state.lock();

        if index > state.index {
            state.index = index;
            state.count = 0;
        }

        if cost > self.limit {
            return Acquire::oversized(u64::from(self.limit - state.count));
        }

        if state.count + cost <= self.limit {
            state.count += cost;
            Acquire::admitted(u64::from(self.limit - state.count))
        } else {
            let elapsed = now.saturating_duration_since(self.epoch);
            let into_window =
                Duration::from_nanos((elapsed.as_nanos() % self.window.as_nanos().max(1)) as u64);
            let retry_after = self.window.saturating_sub(into_window);
            Acquire::denied(u64::from(self.limit - state.count), retry_after)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_resets_on_boundary() {
        let epoch = Instant::now();
        let limiter = FixedWindow::with_epoch(2, Duration::from_secs(10), epoch);

        assert!(limiter.try_acquire_at(1, epoch).allowed);
        assert!(
            limiter
                .try_acquire_at(1, epoch + Duration::from_secs(5))
                .allowed
        );

        let denied = limiter.try_acquire_at(1, epoch + Duration::from_secs(6));
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::from_secs(4));

        // New window, fresh budget.
        assert!(
            limiter
                .try_acquire_at(1, epoch + Duration::from_secs(10))
                .allowed
        );
    }

    #[test]
    fn boundary_allows_double_burst_by_design() {
        let epoch = Instant::now();
        let limiter = FixedWindow::with_epoch(3, Duration::from_secs(10), epoch);

        // Full budget just before the boundary, full budget just after:
        // a rolling 10s span observes 2 * limit admissions. Expected
        // behavior for this algorithm family, asserted so nobody "fixes"
        // it into a sliding window.
        let before = epoch + Duration::from_millis(9_900);
        let after = epoch + Duration::from_millis(10_100);

        let mut admitted = 0;
        for _ in 0..3 {
            if limiter.try_acquire_at(1, before).allowed {
                admitted += 1;
            }
        }
        for _ in 0..3 {
            if limiter.try_acquire_at(1, after).allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 6);

        // Within a single window the limit still holds.
        assert!(!limiter.try_acquire_at(1, after).allowed);
    }

    #[test]
    fn oversized_cost_is_always_rejected() {
        let epoch = Instant::now();
        let limiter = FixedWindow::with_epoch(3, Duration::from_secs(1), epoch);

        let result = limiter.try_acquire_at(4, epoch);
        assert!(!result.allowed);
        assert!(result.oversized);
        assert!(limiter.try_acquire_at(4, epoch + Duration::from_secs(5)).oversized);
    }

    #[test]
    fn stale_clock_reading_stays_in_current_window() {
        let epoch = Instant::now();
        let limiter = FixedWindow::with_epoch(1, Duration::from_secs(10), epoch);

        assert!(
            limiter
                .try_acquire_at(1, epoch + Duration::from_secs(15))
                .allowed
        );
        // An older reading must not resurrect the previous window's budget.
        assert!(!limiter.try_acquire_at(1, epoch + Duration::from_secs(14)).allowed);
    }
}
