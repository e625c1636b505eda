//! Limiter configuration surface.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{FixedWindow, RateLimiter, SlidingWindow, ThrottleError, TokenBucket};

/// Which algorithm a channel's limiters use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LimiterAlgorithm {
    TokenBucket,
    SlidingWindow,
    FixedWindow,
}

/// What the per-channel limiter instances are keyed by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LimitScope {
    /// One limiter per `(channel, recipient)`.
    #[default]
    Recipient,
    /// One limiter per `(channel, routing rule)`.
    Rule,
}

/// Per-channel limiter configuration.
///
/// Token bucket uses `capacity` + `refill_per_sec`; the window algorithms
/// use `limit` + `window_ms`. The unused fields may be omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    pub algorithm: LimiterAlgorithm,
    /// What limiter instances are keyed by (recipient by default).
    #[serde(default)]
    pub scope: LimitScope,
    /// Bucket capacity (token bucket only).
    #[serde(default)]
    pub capacity: u32,
    /// Refill rate in tokens per second (token bucket only).
    #[serde(default)]
    pub refill_per_sec: Option<f64>,
    /// Window length in milliseconds (window algorithms only).
    #[serde(default)]
    pub window_ms: Option<u64>,
    /// Admissions per window (window algorithms only).
    #[serde(default)]
    pub limit: Option<u32>,
}

impl LimiterConfig {
    /// Shorthand for a token bucket configuration.
    pub fn token_bucket(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            algorithm: LimiterAlgorithm::TokenBucket,
            scope: LimitScope::default(),
            capacity,
            refill_per_sec: Some(refill_per_sec),
            window_ms: None,
            limit: None,
        }
    }

    /// Shorthand for a sliding window configuration.
    pub fn sliding_window(limit: u32, window: Duration) -> Self {
        Self {
            algorithm: LimiterAlgorithm::SlidingWindow,
            scope: LimitScope::default(),
            capacity: 0,
            refill_per_sec: None,
            window_ms: Some(window.as_millis() as u64),
            limit: Some(limit),
        }
    }

    /// Shorthand for a fixed window configuration.
    pub fn fixed_window(limit: u32, window: Duration) -> Self {
        Self {
            algorithm: LimiterAlgorithm::FixedWindow,
            scope: LimitScope::default(),
            capacity: 0,
            refill_per_sec: None,
            window_ms: Some(window.as_millis() as u64),
            limit: Some(limit),
        }
    }

    /// Change what limiter instances are keyed by.
    pub fn with_scope(mut self, scope: LimitScope) -> Self {
        self.scope = scope;
        self
    }

    /// Validate the configuration for a channel, naming the channel in
    /// the error so misconfiguration is diagnosable at startup.
    pub(crate) fn validate(&self, channel: &str) -> Result<(), ThrottleError> {
        let invalid = |reason: &str| ThrottleError::InvalidConfig {
            channel: channel.to_string(),
            reason: reason.to_string(),
        };

        match self.algorithm {
            LimiterAlgorithm::TokenBucket => {
                if self.capacity == 0 {
                    return Err(invalid("token bucket requires capacity > 0"));
                }
                match self.refill_per_sec {
                    Some(rate) if rate > 0.0 => Ok(()),
                    _ => Err(invalid("token bucket requires refill_per_sec > 0")),
                }
            }
            LimiterAlgorithm::SlidingWindow | LimiterAlgorithm::FixedWindow => {
                match (self.limit, self.window_ms) {
                    (Some(limit), Some(window_ms)) if limit > 0 && window_ms > 0 => Ok(()),
                    _ => Err(invalid("window algorithms require limit > 0 and window_ms > 0")),
                }
            }
        }
    }

    /// Build a limiter instance for this configuration.
    ///
    /// Callers validate first; an invalid configuration here falls back to
    /// degenerate-but-safe parameters instead of panicking.
    pub(crate) fn build(&self) -> Arc<dyn RateLimiter> {
        match self.algorithm {
            LimiterAlgorithm::TokenBucket => Arc::new(TokenBucket::new(
                self.capacity.max(1),
                self.refill_per_sec.unwrap_or(1.0),
            )),
            LimiterAlgorithm::SlidingWindow => Arc::new(SlidingWindow::new(
                self.limit.unwrap_or(1).max(1),
                Duration::from_millis(self.window_ms.unwrap_or(1_000).max(1)),
            )),
            LimiterAlgorithm::FixedWindow => Arc::new(FixedWindow::new(
                self.limit.unwrap_or(1).max(1),
                Duration::from_millis(self.window_ms.unwrap_or(1_000).max(1)),
            )),
        }
    }
}
