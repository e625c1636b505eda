//! The notification service.
//!
//! Orchestrates one `dispatch` call end to end: idempotency check,
//! routing, rate-limited channel delivery with retries, outcome
//! tracking, and the independent webhook fan-out. Per-channel and
//! per-endpoint failures are captured in the returned result, never
//! raised; the only synchronous error is a malformed request.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use moka::sync::Cache;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use throttle::{LimitScope, RateLimitManager};
use tokio::sync::{Semaphore, broadcast};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::request::NotificationRequest;
use crate::retry::RetryPolicy;
use crate::router::{PlannedSend, RouteDecision, SmartRouter};
use crate::template::TemplateEngine;
use crate::tracker::{AttemptOutcome, DeliveryAttempt, DeliveryTracker, ErrorClass};
use crate::webhook::{WebhookDeliveryResult, WebhookManager};
use crate::{Error, Result};

/// Capacity of the completed-result broadcast stream.
const RESULT_STREAM_CAPACITY: usize = 256;

/// Configuration for the notification service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Retry policy for transient channel send failures.
    #[serde(default)]
    pub channel_retry: RetryPolicy,
    /// How long a request id suppresses re-dispatch.
    #[serde(default = "default_dedupe_ttl_secs")]
    pub dedupe_ttl_secs: u64,
    /// Maximum concurrent channel sends per request.
    #[serde(default = "default_max_parallel_sends")]
    pub max_parallel_sends: usize,
    /// Overall per-request deadline in milliseconds. In-flight sends
    /// finish, but no retry is scheduled past it.
    #[serde(default = "default_request_deadline_ms")]
    pub request_deadline_ms: u64,
    /// Dead letter retention in days.
    #[serde(default = "default_dead_letter_retention_days")]
    pub dead_letter_retention_days: u32,
}

fn default_dedupe_ttl_secs() -> u64 {
    300
}

fn default_max_parallel_sends() -> usize {
    8
}

fn default_request_deadline_ms() -> u64 {
    30_000
}

fn default_dead_letter_retention_days() -> u32 {
    7
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            channel_retry: RetryPolicy::default(),
            dedupe_ttl_secs: default_dedupe_ttl_secs(),
            max_parallel_sends: default_max_parallel_sends(),
            request_deadline_ms: default_request_deadline_ms(),
            dead_letter_retention_days: default_dead_letter_retention_days(),
        }
    }
}

/// Terminal state of one channel delivery, as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChannelStatus {
    /// The provider accepted the payload.
    Delivered {
        provider_message_id: Option<String>,
    },
    /// A permanent failure (provider rejection or render error); no
    /// retry was attempted.
    Failed { message: String },
    /// The rate limiter denied admission; `retry_after_ms` hints when a
    /// fresh dispatch could succeed.
    RateLimited { retry_after_ms: u64 },
    /// Transient failures used up the retry budget.
    Exhausted,
    /// The per-request deadline (or shutdown) arrived first.
    TimedOut,
}

/// Result of one planned channel delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelResult {
    pub channel: String,
    /// The routing rule that planned this send.
    pub rule_id: String,
    /// Provider send attempts actually performed (rate-limit denials and
    /// render failures perform none).
    pub attempts: u32,
    pub status: ChannelStatus,
}

/// Aggregate outcome of one dispatch. Always reflects the true
/// per-channel and per-endpoint outcomes, even when some failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationResult {
    pub request_id: String,
    pub route_decision: RouteDecision,
    pub channel_results: Vec<ChannelResult>,
    pub webhook_results: Vec<WebhookDeliveryResult>,
    pub completed_at: DateTime<Utc>,
}

/// A channel delivery that never succeeded, kept for operator replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: u64,
    pub request: NotificationRequest,
    pub channel: String,
    pub rule_id: String,
    /// Provider send attempts made before giving up.
    pub attempts: u32,
    pub error: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Point-in-time service counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStats {
    pub dedupe_entries: u64,
    pub dead_letters: usize,
    pub channels: usize,
    pub webhook_endpoints: usize,
    pub limiter_instances: usize,
}

/// The dispatch orchestrator.
pub struct NotificationService {
    config: ServiceConfig,
    router: SmartRouter,
    limits: Arc<RateLimitManager>,
    channels: RwLock<HashMap<String, Arc<dyn Channel>>>,
    templates: Arc<dyn TemplateEngine>,
    tracker: Arc<dyn DeliveryTracker>,
    webhooks: Arc<WebhookManager>,
    dedupe: Cache<String, NotificationResult>,
    dead_letters: DashMap<u64, DeadLetterEntry>,
    next_dead_letter_id: AtomicU64,
    result_tx: broadcast::Sender<NotificationResult>,
    cancel: CancellationToken,
}

impl NotificationService {
    pub fn new(
        config: ServiceConfig,
        router: SmartRouter,
        limits: Arc<RateLimitManager>,
        templates: Arc<dyn TemplateEngine>,
        tracker: Arc<dyn DeliveryTracker>,
        webhooks: Arc<WebhookManager>,
    ) -> Self {
        let dedupe = Cache::builder()
            .time_to_live(Duration::from_secs(config.dedupe_ttl_secs.max(1)))
            .build();
        let (result_tx, _) = broadcast::channel(RESULT_STREAM_CAPACITY);

        Self {
            router,
            limits,
            channels: RwLock::new(HashMap::new()),
            templates,
            tracker,
            webhooks,
            dedupe,
            dead_letters: DashMap::new(),
            next_dead_letter_id: AtomicU64::new(1),
            result_tx,
            cancel: CancellationToken::new(),
            config,
        }
    }

    /// Register a channel adapter under its name. Routing rules refer to
    /// channels by this name.
    pub fn register_channel(&self, channel: Arc<dyn Channel>) {
        let name = channel.name().to_string();
        info!(channel = %name, "registered notification channel");
        self.channels.write().insert(name, channel);
    }

    /// The webhook registry, for endpoint management.
    pub fn webhooks(&self) -> &WebhookManager {
        self.webhooks.as_ref()
    }

    /// Subscribe to completed dispatch results. Lagging receivers miss
    /// results rather than applying backpressure.
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationResult> {
        self.result_tx.subscribe()
    }

    /// Dispatch one request.
    ///
    /// Returns an error only for malformed requests; every downstream
    /// failure is reported inside the result.
    pub async fn dispatch(&self, request: NotificationRequest) -> Result<NotificationResult> {
        request.validate()?;

        if let Some(cached) = self.dedupe.get(&request.id) {
            debug!(request = %request.id, "duplicate dispatch suppressed by dedupe window");
            return Ok(cached);
        }

        let decision = self.router.route(&request);
        if decision.is_empty() {
            debug!(request = %request.id, "no routing rule matched");
        }

        let deadline = Instant::now() + Duration::from_millis(self.config.request_deadline_ms);

        // Parallelism is bounded per request, so a broad channel plan
        // cannot fan out without limit against one recipient.
        let permits = Semaphore::new(self.config.max_parallel_sends.max(1));
        let channel_sends = join_all(
            decision
                .planned
                .iter()
                .map(|planned| self.deliver_channel(&request, planned, deadline, &permits)),
        );
        let webhook_fanout = self.webhooks.dispatch_until(&request, Some(deadline));

        // Channel plan and webhook fan-out proceed independently; a
        // failure on either side never blocks the other.
        let (channel_results, webhook_results) = tokio::join!(channel_sends, webhook_fanout);

        for result in &channel_results {
            if matches!(
                result.status,
                ChannelStatus::Exhausted | ChannelStatus::TimedOut
            ) {
                self.dead_letter(&request, result);
            }
        }

        let result = NotificationResult {
            request_id: request.id.clone(),
            route_decision: decision,
            channel_results,
            webhook_results,
            completed_at: Utc::now(),
        };

        self.dedupe.insert(request.id.clone(), result.clone());
        let _ = self.result_tx.send(result.clone());
        Ok(result)
    }

    /// Deliver to one planned channel: admission check, render, send,
    /// bounded retry. Attempts for one `(request, channel)` pair run
    /// strictly sequentially in here; concurrency exists only across
    /// channels.
    async fn deliver_channel(
        &self,
        request: &NotificationRequest,
        planned: &PlannedSend,
        deadline: Instant,
        permits: &Semaphore,
    ) -> ChannelResult {
        let _permit = permits.acquire().await.ok();

        let finish = |attempts: u32, status: ChannelStatus| ChannelResult {
            channel: planned.channel.clone(),
            rule_id: planned.rule_id.clone(),
            attempts,
            status,
        };

        // Continue attempt numbering where any earlier cycle for this
        // pair left off, so numbers stay strictly increasing.
        let mut record_number = self
            .tracker
            .history(&request.id)
            .await
            .iter()
            .filter(|attempt| attempt.channel == planned.channel)
            .map(|attempt| attempt.attempt_number)
            .max()
            .unwrap_or(0);

        let channel = self.channels.read().get(&planned.channel).cloned();
        let Some(channel) = channel else {
            warn!(channel = %planned.channel, "routed to unregistered channel");
            let message = format!("channel not registered: {}", planned.channel);
            record_number += 1;
            self.record(request, planned, record_number, AttemptOutcome::Failed, Some(ErrorClass::Permanent), Some(message.clone()), 0)
                .await;
            record_number += 1;
            self.record(request, planned, record_number, AttemptOutcome::Exhausted, Some(ErrorClass::Permanent), Some(message.clone()), 0)
                .await;
            return finish(0, ChannelStatus::Failed { message });
        };

        // Render once up front. Render failures are terminal: the same
        // template and context will not render on a retry either.
        let payload = match self
            .templates
            .render(&request.template_id, &request.payload_context)
        {
            Ok(payload) => payload,
            Err(error) => {
                warn!(request = %request.id, channel = %planned.channel, %error, "render failed");
                let message = error.to_string();
                record_number += 1;
                self.record(request, planned, record_number, AttemptOutcome::Failed, Some(ErrorClass::Permanent), Some(message.clone()), 0)
                    .await;
                record_number += 1;
                self.record(request, planned, record_number, AttemptOutcome::Exhausted, Some(ErrorClass::Permanent), Some(message.clone()), 0)
                    .await;
                return finish(0, ChannelStatus::Failed { message });
            }
        };

        let max_attempts = self.config.channel_retry.max_attempts();
        let mut send_attempts = 0u32;

        loop {
            if self.cancel.is_cancelled() || Instant::now() >= deadline {
                record_number += 1;
                self.record(request, planned, record_number, AttemptOutcome::Exhausted, Some(ErrorClass::Transient), Some("deadline expired".to_string()), 0)
                    .await;
                return finish(send_attempts, ChannelStatus::TimedOut);
            }

            // Every attempt is gated by the channel's limiter, keyed by
            // recipient or rule according to the channel's configured
            // scope.
            let scope_key = match self.limits.scope_for(&planned.channel) {
                LimitScope::Recipient => request.recipient.as_str(),
                LimitScope::Rule => planned.rule_id.as_str(),
            };
            let acquire = self.limits.check(&planned.channel, scope_key, 1);
            if !acquire.allowed {
                let retry_after_ms = acquire.retry_after.as_millis() as u64;
                debug!(
                    request = %request.id,
                    channel = %planned.channel,
                    retry_after_ms,
                    "rate limit denied admission"
                );
                let message = if acquire.oversized {
                    "request cost exceeds configured capacity".to_string()
                } else {
                    format!("rate limited, retry after {retry_after_ms}ms")
                };
                record_number += 1;
                self.record(request, planned, record_number, AttemptOutcome::RateLimited, Some(ErrorClass::Transient), Some(message.clone()), 0)
                    .await;
                record_number += 1;
                self.record(request, planned, record_number, AttemptOutcome::Exhausted, Some(ErrorClass::Transient), Some(message), 0)
                    .await;
                return finish(send_attempts, ChannelStatus::RateLimited { retry_after_ms });
            }

            send_attempts += 1;
            record_number += 1;
            let send_started = Instant::now();

            match channel.send(&payload, &request.recipient).await {
                Ok(receipt) => {
                    let latency_ms = send_started.elapsed().as_millis() as u64;
                    self.record(request, planned, record_number, AttemptOutcome::Delivered, None, None, latency_ms)
                        .await;
                    debug!(request = %request.id, channel = %planned.channel, "delivered");
                    return finish(
                        send_attempts,
                        ChannelStatus::Delivered {
                            provider_message_id: receipt.provider_message_id,
                        },
                    );
                }
                Err(error) if error.transient => {
                    let latency_ms = send_started.elapsed().as_millis() as u64;
                    self.record(request, planned, record_number, AttemptOutcome::Failed, Some(ErrorClass::Transient), Some(error.message.clone()), latency_ms)
                        .await;

                    if send_attempts >= max_attempts {
                        record_number += 1;
                        self.record(request, planned, record_number, AttemptOutcome::Exhausted, Some(ErrorClass::Transient), Some(error.message.clone()), 0)
                            .await;
                        warn!(
                            request = %request.id,
                            channel = %planned.channel,
                            attempts = send_attempts,
                            "retry budget exhausted"
                        );
                        return finish(send_attempts, ChannelStatus::Exhausted);
                    }

                    let delay = self.config.channel_retry.delay_for_attempt(send_attempts - 1);
                    if Instant::now() + delay >= deadline {
                        record_number += 1;
                        self.record(request, planned, record_number, AttemptOutcome::Exhausted, Some(ErrorClass::Transient), Some("deadline expired".to_string()), 0)
                            .await;
                        return finish(send_attempts, ChannelStatus::TimedOut);
                    }
                    debug!(
                        request = %request.id,
                        channel = %planned.channel,
                        attempt = send_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after transient failure"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            record_number += 1;
                            self.record(request, planned, record_number, AttemptOutcome::Exhausted, Some(ErrorClass::Transient), Some("shutdown".to_string()), 0)
                                .await;
                            return finish(send_attempts, ChannelStatus::TimedOut);
                        }
                        _ = sleep(delay) => {}
                    }
                }
                Err(error) => {
                    let latency_ms = send_started.elapsed().as_millis() as u64;
                    self.record(request, planned, record_number, AttemptOutcome::Failed, Some(ErrorClass::Permanent), Some(error.message.clone()), latency_ms)
                        .await;
                    record_number += 1;
                    self.record(request, planned, record_number, AttemptOutcome::Exhausted, Some(ErrorClass::Permanent), Some(error.message.clone()), 0)
                        .await;
                    warn!(
                        request = %request.id,
                        channel = %planned.channel,
                        error = %error.message,
                        "permanent send failure"
                    );
                    return finish(send_attempts, ChannelStatus::Failed { message: error.message });
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        request: &NotificationRequest,
        planned: &PlannedSend,
        attempt_number: u32,
        outcome: AttemptOutcome,
        error_class: Option<ErrorClass>,
        error_message: Option<String>,
        latency_ms: u64,
    ) {
        let now = Utc::now();
        self.tracker
            .record(DeliveryAttempt {
                request_id: request.id.clone(),
                channel: planned.channel.clone(),
                attempt_number,
                started_at: now,
                finished_at: now,
                outcome,
                error_class,
                error_message,
                latency_ms,
            })
            .await;
    }

    fn dead_letter(&self, request: &NotificationRequest, result: &ChannelResult) {
        let id = self.next_dead_letter_id.fetch_add(1, Ordering::SeqCst);
        let error = match &result.status {
            ChannelStatus::Exhausted => "retry budget exhausted".to_string(),
            ChannelStatus::TimedOut => "deadline expired".to_string(),
            other => format!("{other:?}"),
        };
        warn!(
            request = %request.id,
            channel = %result.channel,
            dead_letter = id,
            "channel delivery dead-lettered"
        );
        self.dead_letters.insert(
            id,
            DeadLetterEntry {
                id,
                request: request.clone(),
                channel: result.channel.clone(),
                rule_id: result.rule_id.clone(),
                attempts: result.attempts,
                error,
                dead_lettered_at: Utc::now(),
            },
        );
    }

    /// Snapshot of the dead letter queue.
    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.dead_letters.iter().map(|e| e.value().clone()).collect()
    }

    /// Re-deliver a dead-lettered request to the channel that failed,
    /// bypassing routing. A delivery that fails again is dead-lettered
    /// under a fresh id.
    pub async fn retry_dead_letter(&self, id: u64) -> Result<ChannelResult> {
        let Some((_, entry)) = self.dead_letters.remove(&id) else {
            return Err(Error::not_found("DeadLetter", id.to_string()));
        };

        let planned = PlannedSend {
            channel: entry.channel.clone(),
            rule_id: entry.rule_id.clone(),
        };
        let deadline = Instant::now() + Duration::from_millis(self.config.request_deadline_ms);
        let permits = Semaphore::new(1);
        let result = self
            .deliver_channel(&entry.request, &planned, deadline, &permits)
            .await;

        if matches!(
            result.status,
            ChannelStatus::Exhausted | ChannelStatus::TimedOut
        ) {
            self.dead_letter(&entry.request, &result);
        }
        Ok(result)
    }

    /// Drop dead letters older than the configured retention.
    pub fn cleanup_dead_letters(&self) {
        let retention =
            chrono::Duration::days(i64::from(self.config.dead_letter_retention_days));
        let cutoff = Utc::now() - retention;
        self.dead_letters
            .retain(|_, entry| entry.dead_lettered_at > cutoff);
    }

    /// Point-in-time counters.
    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            dedupe_entries: self.dedupe.entry_count(),
            dead_letters: self.dead_letters.len(),
            channels: self.channels.read().len(),
            webhook_endpoints: self.webhooks.endpoint_count(),
            limiter_instances: self.limits.instance_count(),
        }
    }

    /// Stop scheduling retries everywhere; in-flight sends finish.
    pub fn shutdown(&self) {
        info!("shutting down notification service");
        self.cancel.cancel();
        self.webhooks.shutdown();
    }
}
