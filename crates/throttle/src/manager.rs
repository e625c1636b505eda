//! Keyed limiter management.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::{Acquire, LimitScope, LimiterConfig, RateLimiter, ThrottleError};

/// Routes admission checks to one limiter instance per
/// `(channel, scope_key)` pair.
///
/// Instances are created lazily on first use and cached for the process
/// lifetime. Each instance serializes its own state; the manager map is a
/// concurrent map, so checks on different keys never contend.
///
/// A channel with no configuration is **unlimited**: every check is
/// admitted. This is an explicit policy so that adding a new channel never
/// silently drops traffic before its limits are tuned.
pub struct RateLimitManager {
    configs: HashMap<String, LimiterConfig>,
    limiters: DashMap<(String, String), Arc<dyn RateLimiter>>,
}

impl RateLimitManager {
    /// Build a manager from per-channel configuration, validating every
    /// entry up front.
    pub fn new(configs: HashMap<String, LimiterConfig>) -> Result<Self, ThrottleError> {
        for (channel, config) in &configs {
            config.validate(channel)?;
        }
        Ok(Self {
            configs,
            limiters: DashMap::new(),
        })
    }

    /// A manager with no limits configured at all.
    pub fn unlimited() -> Self {
        Self {
            configs: HashMap::new(),
            limiters: DashMap::new(),
        }
    }

    /// Admission check for `cost` units against the limiter for
    /// `(channel, scope_key)`.
    pub fn check(&self, channel: &str, scope_key: &str, cost: u32) -> Acquire {
        let Some(config) = self.configs.get(channel) else {
            return Acquire::unlimited();
        };

        let key = (channel.to_string(), scope_key.to_string());
        let limiter = self
            .limiters
            .entry(key)
            .or_insert_with(|| {
                debug!(channel, scope_key, "creating rate limiter instance");
                config.build()
            })
            .clone();

        limiter.try_acquire(cost)
    }

    /// The configured scope for a channel's limiters. Unconfigured
    /// channels report the default scope (their checks are unlimited
    /// anyway).
    pub fn scope_for(&self, channel: &str) -> LimitScope {
        self.configs
            .get(channel)
            .map(|config| config.scope)
            .unwrap_or_default()
    }

    /// Number of live limiter instances (distinct keys seen so far).
    pub fn instance_count(&self) -> usize {
        self.limiters.len()
    }
}
