//! # Throttle
//!
//! Keyed rate limiting with interchangeable algorithms.
//!
//! This crate provides three rate limiting algorithms behind a single
//! [`RateLimiter`] trait, plus a [`RateLimitManager`] that lazily creates
//! and caches one limiter instance per `(channel, scope_key)` pair:
//!
//! - [`TokenBucket`]: smooth average-rate enforcement with burst
//!   allowance up to the bucket capacity
//! - [`SlidingWindow`]: exact rolling-window admission guarantee
//! - [`FixedWindow`]: cheap aligned-window counting (up to a 2x burst
//!   across a window boundary, see the type docs)
//!
//! Every limiter exposes a deterministic [`RateLimiter::try_acquire_at`]
//! taking an explicit `Instant`, which is what the algorithm tests drive.

use std::time::{Duration, Instant};

mod config;
mod fixed_window;
mod manager;
mod sliding_window;
mod token_bucket;

pub use config::{LimitScope, LimiterAlgorithm, LimiterConfig};
pub use fixed_window::FixedWindow;
pub use manager::RateLimitManager;
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

use thiserror::Error;

/// Errors produced when building limiters from configuration.
#[derive(Debug, Error)]
pub enum ThrottleError {
    /// The configuration is missing a parameter or holds an invalid value.
    #[error("invalid limiter config for channel '{channel}': {reason}")]
    InvalidConfig { channel: String, reason: String },
}

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Acquire {
    /// Whether the request was admitted.
    pub allowed: bool,
    /// Remaining budget after this check (tokens or window slots).
    pub remaining: u64,
    /// How long until a request of the same cost could be admitted.
    /// Zero when `allowed` is true or when the request is oversized.
    pub retry_after: Duration,
    /// The cost exceeds the configured capacity/limit outright; no amount
    /// of waiting would admit it. Always reported with `allowed == false`.
    pub oversized: bool,
}

impl Acquire {
    pub(crate) fn admitted(remaining: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after: Duration::ZERO,
            oversized: false,
        }
    }

    pub(crate) fn denied(remaining: u64, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            remaining,
            retry_after,
            oversized: false,
        }
    }

    pub(crate) fn oversized(remaining: u64) -> Self {
        Self {
            allowed: false,
            remaining,
            retry_after: Duration::ZERO,
            oversized: true,
        }
    }

    /// An always-allowed result for channels with no configured limit.
    pub fn unlimited() -> Self {
        Self::admitted(u64::MAX)
    }
}

/// A rate limiter instance for a single key.
///
/// Implementations serialize state mutation internally, so a single
/// instance is safe to share across tasks. The manager owns one instance
/// per key; there is no global lock.
pub trait RateLimiter: Send + Sync {
    /// Admission check against an explicit clock reading.
    ///
    /// `now` values must be monotonically non-decreasing per instance;
    /// implementations clamp backwards jumps rather than panicking.
    fn try_acquire_at(&self, cost: u32, now: Instant) -> Acquire;

    /// Admission check against the current time.
    fn try_acquire(&self, cost: u32) -> Acquire {
        self.try_acquire_at(cost, Instant::now())
    }
}
