//! Delivery attempt tracking.
//!
//! Trackers record the lifecycle of every send attempt and serve
//! aggregate metrics and per-request history. Two backends implement the
//! same contract: [`MemoryTracker`] (bounded ring buffers, lost on
//! restart) and [`SqliteTracker`] (durable rows with per-row TTL and
//! running counters).
//!
//! Recording is infallible by contract: tracking failures must never
//! block or fail a delivery, so backends absorb their own errors.

mod durable;
mod memory;

pub use durable::SqliteTracker;
pub use memory::MemoryTracker;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one delivery attempt.
///
/// `Delivered` and `Exhausted` are terminal; `Failed` and `RateLimited`
/// are always followed by another attempt or an `Exhausted` record for
/// the same `(request_id, channel)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Delivered,
    Failed,
    RateLimited,
    Exhausted,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::RateLimited => "rate_limited",
            Self::Exhausted => "exhausted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            "rate_limited" => Some(Self::RateLimited),
            "exhausted" => Some(Self::Exhausted),
            _ => None,
        }
    }
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Permanent,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "transient" => Some(Self::Transient),
            "permanent" => Some(Self::Permanent),
            _ => None,
        }
    }
}

/// One try to deliver a request over one channel. Immutable once
/// finalized; `attempt_number` starts at 1 and increases strictly per
/// `(request_id, channel)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub request_id: String,
    pub channel: String,
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    #[serde(default)]
    pub error_class: Option<ErrorClass>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub latency_ms: u64,
}

/// Filter for [`DeliveryTracker::metrics`].
#[derive(Debug, Clone, Default)]
pub struct MetricsFilter {
    /// Restrict to one channel; `None` aggregates across all channels.
    pub channel: Option<String>,
}

impl MetricsFilter {
    pub fn channel(channel: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
        }
    }
}

/// Aggregate delivery metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryMetrics {
    /// `delivered / (delivered + exhausted)`; zero when no terminal
    /// attempts are in range.
    pub success_rate: f64,
    /// Mean latency over actual sends (`delivered` and `failed`
    /// attempts); bookkeeping records do not contribute.
    pub avg_latency_ms: f64,
    pub counts_by_outcome: BTreeMap<String, u64>,
    pub counts_by_channel: BTreeMap<String, u64>,
}

impl DeliveryMetrics {
    /// Aggregate from `(channel, outcome, count, latency_ms_total)` rows.
    /// Both backends reduce to this shape: the memory backend by
    /// scanning its buffers, the durable backend from its counter table.
    pub(crate) fn from_counts<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = (String, AttemptOutcome, u64, u64)>,
    {
        let mut metrics = Self::default();
        let mut delivered = 0u64;
        let mut exhausted = 0u64;
        let mut send_count = 0u64;
        let mut send_latency_total = 0u64;

        for (channel, outcome, count, latency_ms_total) in rows {
            *metrics
                .counts_by_outcome
                .entry(outcome.as_str().to_string())
                .or_default() += count;
            *metrics.counts_by_channel.entry(channel).or_default() += count;

            match outcome {
                AttemptOutcome::Delivered => {
                    delivered += count;
                    send_count += count;
                    send_latency_total += latency_ms_total;
                }
                AttemptOutcome::Failed => {
                    send_count += count;
                    send_latency_total += latency_ms_total;
                }
                AttemptOutcome::Exhausted => exhausted += count,
                AttemptOutcome::RateLimited => {}
            }
        }

        if delivered + exhausted > 0 {
            metrics.success_rate = delivered as f64 / (delivered + exhausted) as f64;
        }
        if send_count > 0 {
            metrics.avg_latency_ms = send_latency_total as f64 / send_count as f64;
        }
        metrics
    }
}

/// Records attempt lifecycle events and serves aggregates.
#[async_trait]
pub trait DeliveryTracker: Send + Sync {
    /// Record one attempt. Never fails: backends absorb persistence
    /// errors internally.
    async fn record(&self, attempt: DeliveryAttempt);

    /// All recorded attempts for a request, in insertion order.
    async fn history(&self, request_id: &str) -> Vec<DeliveryAttempt>;

    /// Aggregate metrics over the backend's retained window.
    async fn metrics(&self, filter: &MetricsFilter) -> DeliveryMetrics;
}
