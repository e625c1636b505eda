//! In-process delivery tracking.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{DeliveryAttempt, DeliveryMetrics, DeliveryTracker, MetricsFilter};

/// An attempt plus its global insertion sequence, so history can be
/// reassembled in insertion order across per-channel buffers.
#[derive(Debug, Clone)]
struct Recorded {
    seq: u64,
    attempt: DeliveryAttempt,
}

/// Bounded in-process tracker.
///
/// Keeps one ring buffer per channel with a configurable capacity;
/// metrics are computed on demand by scanning the buffers. Data is lost
/// on process restart, the deliberate trade-off for deployments where
/// delivery history is nice-to-have rather than audit material.
pub struct MemoryTracker {
    capacity: usize,
    next_seq: AtomicU64,
    buffers: RwLock<HashMap<String, VecDeque<Recorded>>>,
}

impl MemoryTracker {
    /// `capacity` bounds each per-channel buffer; the oldest attempt is
    /// evicted when a buffer is full.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_seq: AtomicU64::new(0),
            buffers: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl DeliveryTracker for MemoryTracker {
    async fn record(&self, attempt: DeliveryAttempt) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let mut buffers = self.buffers.write();
        let buffer = buffers.entry(attempt.channel.clone()).or_default();
        if buffer.len() >= self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(Recorded { seq, attempt });
    }

    async fn history(&self, request_id: &str) -> Vec<DeliveryAttempt> {
        let buffers = self.buffers.read();
        let mut matching: Vec<&Recorded> = buffers
            .values()
            .flatten()
            .filter(|r| r.attempt.request_id == request_id)
            .collect();
        matching.sort_by_key(|r| r.seq);
        matching.into_iter().map(|r| r.attempt.clone()).collect()
    }

    async fn metrics(&self, filter: &MetricsFilter) -> DeliveryMetrics {
        let buffers = self.buffers.read();
        DeliveryMetrics::from_counts(
            buffers
                .iter()
                .filter(|(channel, _)| {
                    filter
                        .channel
                        .as_ref()
                        .is_none_or(|wanted| *channel == wanted)
                })
                .flat_map(|(_, buffer)| buffer.iter())
                .map(|r| {
                    (
                        r.attempt.channel.clone(),
                        r.attempt.outcome,
                        1,
                        r.attempt.latency_ms,
                    )
                }),
        )
    }
}
