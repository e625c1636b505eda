//! Webhook fan-out.
//!
//! External subscribers register an endpoint with a severity/tag filter.
//! Matching requests are serialized once, signed per endpoint with its
//! secret, and POSTed with bounded retry. Every endpoint's delivery runs
//! as an independent task: one endpoint backing off never delays another.

mod signature;

pub use signature::{SIGNATURE_HEADER, TIMESTAMP_HEADER, sign, verify};

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::request::{NotificationRequest, Severity};
use crate::retry::RetryPolicy;
use crate::{Error, Result};

/// Event type carried in every webhook payload.
const EVENT_TYPE: &str = "notification.dispatched";

/// Which requests an endpoint wants to see.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookFilter {
    /// Minimum severity (inclusive).
    #[serde(default)]
    pub min_severity: Severity,
    /// When non-empty, the request must share at least one tag.
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl WebhookFilter {
    pub fn matches(&self, request: &NotificationRequest) -> bool {
        if request.severity < self.min_severity {
            return false;
        }
        if !self.tags.is_empty() && self.tags.is_disjoint(&request.tags) {
            return false;
        }
        true
    }
}

/// Delivery counters for one endpoint. Mutated only by the manager's
/// delivery loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointStats {
    pub success_count: u64,
    pub failure_count: u64,
    pub last_delivery_at: Option<DateTime<Utc>>,
}

/// A registered external subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub id: String,
    pub url: String,
    /// Shared secret used to sign payloads for this endpoint.
    pub secret: String,
    #[serde(default)]
    pub filter: WebhookFilter,
    #[serde(default)]
    pub stats: EndpointStats,
}

impl WebhookEndpoint {
    /// Build an endpoint with a fresh id and default filter.
    pub fn new(url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            url: url.into(),
            secret: secret.into(),
            filter: WebhookFilter::default(),
            stats: EndpointStats::default(),
        }
    }

    pub fn with_filter(mut self, filter: WebhookFilter) -> Self {
        self.filter = filter;
        self
    }
}

/// The stable wire payload. Receivers verify the signature over the
/// exact body bytes before trusting any field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub id: String,
    pub severity: Severity,
    pub tags: BTreeSet<String>,
    pub recipient: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
}

impl WebhookPayload {
    fn for_request(request: &NotificationRequest) -> Self {
        Self {
            id: request.id.clone(),
            severity: request.severity,
            tags: request.tags.clone(),
            recipient: request.recipient.clone(),
            timestamp: request.created_at,
            event_type: EVENT_TYPE.to_string(),
        }
    }
}

/// Terminal state of one endpoint delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WebhookStatus {
    /// A 2xx response.
    Delivered { http_status: u16 },
    /// A non-retryable response (4xx other than 408/429).
    Rejected { http_status: u16 },
    /// Retry budget used up on retryable failures.
    Exhausted,
    /// The per-request deadline or a shutdown arrived before a terminal
    /// response; no further retries were scheduled.
    TimedOut,
}

/// Outcome of one endpoint's delivery for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDeliveryResult {
    pub endpoint_id: String,
    pub request_id: String,
    pub status: WebhookStatus,
    /// HTTP attempts actually made.
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

/// A transport-level failure (connect, TLS, timeout). Always retryable;
/// HTTP responses are classified by status instead.
#[derive(Debug, Clone)]
pub struct TransportError {
    pub message: String,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "webhook transport error: {}", self.message)
    }
}

impl std::error::Error for TransportError {}

/// HTTP POST seam, so delivery logic and signing are testable without a
/// live server.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &[u8],
    ) -> std::result::Result<u16, TransportError>;
}

/// Production transport over a shared reqwest client.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &[u8],
    ) -> std::result::Result<u16, TransportError> {
        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec());
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| TransportError {
            message: e.to_string(),
        })?;
        Ok(response.status().as_u16())
    }
}

/// Retry/timeout tuning for webhook deliveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDispatchConfig {
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Per-request HTTP timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

impl Default for WebhookDispatchConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            request_timeout_secs: default_timeout_secs(),
        }
    }
}

/// Registry plus signed fan-out.
pub struct WebhookManager {
    endpoints: DashMap<String, WebhookEndpoint>,
    transport: Arc<dyn WebhookTransport>,
    config: WebhookDispatchConfig,
    cancel: CancellationToken,
}

impl WebhookManager {
    pub fn new(config: WebhookDispatchConfig) -> Self {
        let transport = Arc::new(HttpTransport::new(Duration::from_secs(
            config.request_timeout_secs,
        )));
        Self::with_transport(config, transport)
    }

    /// Build with an injected transport (tests, alternative HTTP stacks).
    pub fn with_transport(
        config: WebhookDispatchConfig,
        transport: Arc<dyn WebhookTransport>,
    ) -> Self {
        Self {
            endpoints: DashMap::new(),
            transport,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Register an endpoint, returning its id.
    pub fn register(&self, endpoint: WebhookEndpoint) -> String {
        let id = endpoint.id.clone();
        debug!(endpoint = %id, url = %endpoint.url, "registered webhook endpoint");
        self.endpoints.insert(id.clone(), endpoint);
        id
    }

    /// Remove an endpoint by id.
    pub fn deregister(&self, id: &str) -> Result<()> {
        self.endpoints
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("WebhookEndpoint", id))
    }

    /// Snapshot of all registered endpoints (stats included).
    pub fn list(&self) -> Vec<WebhookEndpoint> {
        self.endpoints.iter().map(|e| e.value().clone()).collect()
    }

    /// Number of registered endpoints.
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Stop scheduling retries; in-flight requests finish.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Fan a request out to every matching endpoint with no deadline.
    pub async fn dispatch(&self, request: &NotificationRequest) -> Vec<WebhookDeliveryResult> {
        self.dispatch_until(request, None).await
    }

    /// Fan a request out, scheduling no retry past `deadline`.
    ///
    /// Endpoint deliveries run concurrently and independently; the
    /// returned results cover exactly the endpoints whose filter matched.
    pub async fn dispatch_until(
        &self,
        request: &NotificationRequest,
        deadline: Option<Instant>,
    ) -> Vec<WebhookDeliveryResult> {
        let targets: Vec<WebhookEndpoint> = self
            .endpoints
            .iter()
            .filter(|e| e.filter.matches(request))
            .map(|e| e.value().clone())
            .collect();
        if targets.is_empty() {
            return Vec::new();
        }

        let payload = WebhookPayload::for_request(request);
        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(error) => {
                warn!(%error, request = %request.id, "failed to serialize webhook payload");
                return Vec::new();
            }
        };
        let body = Arc::new(body);

        join_all(
            targets
                .into_iter()
                .map(|endpoint| self.deliver(endpoint, Arc::clone(&body), &request.id, deadline)),
        )
        .await
    }

    /// Deliver one request to one endpoint with bounded retry, then
    /// update the endpoint's stats. Only this loop writes stats.
    async fn deliver(
        &self,
        endpoint: WebhookEndpoint,
        body: Arc<Vec<u8>>,
        request_id: &str,
        deadline: Option<Instant>,
    ) -> WebhookDeliveryResult {
        let headers = vec![
            (
                SIGNATURE_HEADER.to_string(),
                sign(&body, &endpoint.secret),
            ),
            (
                TIMESTAMP_HEADER.to_string(),
                Utc::now().timestamp().to_string(),
            ),
        ];

        let max_attempts = self.config.retry.max_attempts();
        let mut attempts = 0u32;

        let status = loop {
            if self.cancel.is_cancelled()
                || deadline.is_some_and(|deadline| Instant::now() >= deadline)
            {
                break WebhookStatus::TimedOut;
            }

            attempts += 1;
            match self.transport.post(&endpoint.url, &headers, &body).await {
                Ok(code) if (200..300).contains(&code) => {
                    break WebhookStatus::Delivered { http_status: code };
                }
                Ok(code) if !is_retryable_status(code) => {
                    debug!(
                        endpoint = %endpoint.id,
                        code,
                        "webhook rejected, not retrying"
                    );
                    break WebhookStatus::Rejected { http_status: code };
                }
                Ok(code) => {
                    if attempts >= max_attempts {
                        break WebhookStatus::Exhausted;
                    }
                    debug!(endpoint = %endpoint.id, code, attempts, "webhook attempt failed");
                }
                Err(error) => {
                    if attempts >= max_attempts {
                        break WebhookStatus::Exhausted;
                    }
                    debug!(endpoint = %endpoint.id, %error, attempts, "webhook attempt failed");
                }
            }

            let delay = self.config.retry.delay_for_attempt(attempts - 1);
            if deadline.is_some_and(|deadline| Instant::now() + delay >= deadline) {
                break WebhookStatus::TimedOut;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break WebhookStatus::TimedOut,
                _ = sleep(delay) => {}
            }
        };

        if matches!(status, WebhookStatus::Delivered { .. }) {
            debug!(endpoint = %endpoint.id, request = %request_id, "webhook delivered");
        } else {
            warn!(
                endpoint = %endpoint.id,
                request = %request_id,
                ?status,
                attempts,
                "webhook delivery did not succeed"
            );
        }

        if let Some(mut entry) = self.endpoints.get_mut(&endpoint.id) {
            match status {
                WebhookStatus::Delivered { .. } => {
                    entry.stats.success_count += 1;
                    entry.stats.last_delivery_at = Some(Utc::now());
                }
                _ => entry.stats.failure_count += 1,
            }
        }

        WebhookDeliveryResult {
            endpoint_id: endpoint.id,
            request_id: request_id.to_string(),
            status,
            attempts,
            timestamp: Utc::now(),
        }
    }
}

/// Whether an HTTP status is worth retrying: server errors, timeouts,
/// and throttling. Other 4xx responses are the receiver telling us the
/// request itself is wrong.
fn is_retryable_status(code: u16) -> bool {
    code == 408 || code == 429 || (500..600).contains(&code)
}
