//! Retry-with-backoff policy shared by channel sends and webhook
//! deliveries.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff with jitter and a hard delay cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not counting the initial
    /// attempt).
    pub max_retries: u32,
    /// Base delay in milliseconds. Actual delay = base * 2^attempt,
    /// capped, plus jitter.
    pub base_delay_ms: u64,
    /// Hard cap on the computed delay to prevent unbounded growth.
    pub max_delay_ms: u64,
    /// When true, adds random jitter of up to ±25% of the computed delay
    /// to prevent thundering herds against a recovering endpoint.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter: false,
        }
    }

    /// Total attempts this policy allows (initial + retries).
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Compute the delay before retry `attempt` (0-indexed: the delay
    /// after the first failure is `delay_for_attempt(0)`).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp_delay_ms = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        let capped_ms = exp_delay_ms.min(self.max_delay_ms);

        if !self.jitter || capped_ms == 0 {
            return Duration::from_millis(capped_ms);
        }

        // Jitter of up to ±25%, still honoring the cap.
        let jitter_range = capped_ms / 4;
        let jitter = if jitter_range > 0 {
            (rand::random::<u64>() % (jitter_range * 2)).saturating_sub(jitter_range)
        } else {
            0
        };
        Duration::from_millis(capped_ms.saturating_add(jitter).min(self.max_delay_ms))
    }

    /// Upper bound on the total time spent sleeping between attempts.
    pub fn max_total_delay(&self) -> Duration {
        let mut total_ms = 0u64;
        for attempt in 0..self.max_retries {
            let exp_delay_ms = self
                .base_delay_ms
                .saturating_mul(2u64.saturating_pow(attempt));
            total_ms = total_ms.saturating_add(exp_delay_ms.min(self.max_delay_ms));
        }
        Duration::from_millis(total_ms)
    }
}
