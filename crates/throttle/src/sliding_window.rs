//! Sliding window rate limiting.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::{Acquire, RateLimiter};

/// Sliding window limiter: at most `limit` admissions in any rolling
/// window of the configured length.
///
/// Keeps an ordered log of admission timestamps and purges entries older
/// than `now - window` on every check, so the guarantee is exact: no
/// rolling window of length `window` ever observes more than `limit`
/// admitted requests.
#[derive(Debug)]
pub struct SlidingWindow {
    limit: u32,
    window: Duration,
    admissions: Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            admissions: Mutex::new(VecDeque::new()),
        }
    }
}

impl RateLimiter for SlidingWindow {
    fn try_acquire_at(&self, cost: u32, now: Instant) -> Acquire {
        let mut admissions = self.admissions.lock();

        // Purge entries that have left the rolling window.
        let cutoff = now.checked_sub(self.window);
        if let Some(cutoff) = cutoff {
            while admissions.front().is_some_and(|at| *at <= cutoff) {
                admissions.pop_front();
            }
        }

        let in_window = admissions.len() as u32;
        if cost > self.limit {
            return Acquire::oversized(u64::from(self.limit - in_window));
        }

        if in_window + cost <= self.limit {
            for _ in 0..cost {
                admissions.push_back(now);
            }
            Acquire::admitted(u64::from(self.limit - in_window - cost))
        } else {
            // The request fits once enough of the oldest admissions expire.
            let must_expire = (in_window + cost - self.limit) as usize;
            let retry_after = admissions
                .get(must_expire - 1)
                .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
                .unwrap_or(Duration::ZERO);
            Acquire::denied(u64::from(self.limit - in_window), retry_after)
        }
    }
}
