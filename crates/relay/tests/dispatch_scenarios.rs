//! End-to-end dispatch scenarios with mock channels, templates, and
//! webhook transports.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use relay_engine::channel::{Channel, ProviderReceipt, SendError};
use relay_engine::request::{NotificationRequest, Severity};
use relay_engine::retry::RetryPolicy;
use relay_engine::router::{RouteMode, RoutingRule, RoutingRuleBuilder, SmartRouter};
use relay_engine::service::{ChannelStatus, NotificationService, ServiceConfig};
use relay_engine::template::{TemplateEngine, TemplateError};
use relay_engine::throttle::{LimiterConfig, RateLimitManager};
use relay_engine::tracker::{AttemptOutcome, DeliveryTracker, MemoryTracker};
use relay_engine::webhook::{
    TransportError, WebhookDispatchConfig, WebhookEndpoint, WebhookFilter, WebhookManager,
    WebhookStatus, WebhookTransport,
};

/// Channel double: fails transiently `transient_failures` times, then
/// succeeds; `permanent` forces immediate terminal failures; `delay`
/// simulates provider latency.
struct MockChannel {
    name: &'static str,
    transient_failures: AtomicU32,
    permanent: AtomicBool,
    delay: Duration,
    calls: AtomicU32,
}

impl MockChannel {
    fn reliable(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            transient_failures: AtomicU32::new(0),
            permanent: AtomicBool::new(false),
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        })
    }

    fn flaky(name: &'static str, transient_failures: u32) -> Arc<Self> {
        let channel = Self::reliable(name);
        channel
            .transient_failures
            .store(transient_failures, Ordering::SeqCst);
        channel
    }

    fn rejecting(name: &'static str) -> Arc<Self> {
        let channel = Self::reliable(name);
        channel.permanent.store(true, Ordering::SeqCst);
        channel
    }

    fn slow(name: &'static str, delay: Duration, transient_failures: u32) -> Arc<Self> {
        Arc::new(Self {
            name,
            transient_failures: AtomicU32::new(transient_failures),
            permanent: AtomicBool::new(false),
            delay,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn name(&self) -> &str {
        self.name
    }

    async fn send(
        &self,
        _payload: &str,
        _recipient: &str,
    ) -> std::result::Result<ProviderReceipt, SendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.permanent.load(Ordering::SeqCst) {
            return Err(SendError::permanent("provider rejected recipient"));
        }
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
        {
            return Err(SendError::transient("provider returned 503"));
        }
        Ok(ProviderReceipt {
            provider_message_id: Some("msg-1".to_string()),
        })
    }
}

/// Template double: simple `{key}` substitution; unknown template ids
/// and unresolved placeholders fail the way a real renderer would.
struct StaticTemplates {
    templates: HashMap<String, String>,
}

impl StaticTemplates {
    fn with(entries: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            templates: entries
                .iter()
                .map(|(id, body)| (id.to_string(), body.to_string()))
                .collect(),
        })
    }
}

impl TemplateEngine for StaticTemplates {
    fn render(
        &self,
        template_id: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> std::result::Result<String, TemplateError> {
        let template = self
            .templates
            .get(template_id)
            .ok_or_else(|| TemplateError::NotFound(template_id.to_string()))?;

        let mut rendered = template.clone();
        for (key, value) in context {
            let replacement = value
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string());
            rendered = rendered.replace(&format!("{{{key}}}"), &replacement);
        }

        if rendered.contains('{') {
            return Err(TemplateError::Render(format!(
                "unresolved placeholder in template {template_id}"
            )));
        }
        Ok(rendered)
    }
}

/// Webhook transport double that always answers with one status code.
struct FixedTransport {
    status: u16,
    calls: Mutex<Vec<Vec<u8>>>,
}

impl FixedTransport {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            status: 200,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl WebhookTransport for FixedTransport {
    async fn post(
        &self,
        _url: &str,
        _headers: &[(String, String)],
        body: &[u8],
    ) -> std::result::Result<u16, TransportError> {
        self.calls.lock().unwrap().push(body.to_vec());
        Ok(self.status)
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        base_delay_ms: 1,
        max_delay_ms: 2,
        jitter: false,
    }
}

fn test_config() -> ServiceConfig {
    ServiceConfig {
        channel_retry: fast_retry(),
        dedupe_ttl_secs: 60,
        max_parallel_sends: 4,
        request_deadline_ms: 5_000,
        dead_letter_retention_days: 7,
    }
}

fn severity_rule(id: &str, min: Severity, channels: &[&str]) -> RoutingRule {
    RoutingRuleBuilder::new(id, 10)
        .min_severity(min)
        .channels(channels.iter().copied())
        .mode(RouteMode::FirstMatch)
        .build()
}

struct Harness {
    service: NotificationService,
    tracker: Arc<MemoryTracker>,
    transport: Arc<FixedTransport>,
}

fn harness(
    config: ServiceConfig,
    rules: Vec<RoutingRule>,
    limits: RateLimitManager,
    channels: Vec<Arc<MockChannel>>,
) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let tracker = Arc::new(MemoryTracker::new(256));
    let transport = FixedTransport::ok();
    let webhooks = Arc::new(WebhookManager::with_transport(
        WebhookDispatchConfig {
            retry: fast_retry(),
            request_timeout_secs: 1,
        },
        transport.clone(),
    ));
    let templates = StaticTemplates::with(&[
        ("alert", "[{level}] something happened"),
        ("plain", "all good"),
    ]);

    let service = NotificationService::new(
        config,
        SmartRouter::new(rules),
        Arc::new(limits),
        templates,
        tracker.clone(),
        webhooks,
    );
    for channel in channels {
        service.register_channel(channel);
    }

    Harness {
        service,
        tracker,
        transport,
    }
}

fn request(id: &str, severity: Severity) -> NotificationRequest {
    NotificationRequest::new(id, severity, "alice", "plain")
}

#[tokio::test]
async fn critical_alert_fans_out_to_all_routed_channels() {
    let sms = MockChannel::reliable("sms");
    let email = MockChannel::reliable("email");
    let harness = harness(
        test_config(),
        vec![
            RoutingRuleBuilder::new("critical-page", 1)
                .min_severity(Severity::Critical)
                .channels(["sms", "email"])
                .build(),
        ],
        RateLimitManager::unlimited(),
        vec![sms.clone(), email.clone()],
    );

    let result = harness
        .service
        .dispatch(request("req-1", Severity::Critical))
        .await
        .unwrap();

    assert_eq!(result.route_decision.planned.len(), 2);
    assert_eq!(result.channel_results.len(), 2);
    for channel_result in &result.channel_results {
        assert!(matches!(
            channel_result.status,
            ChannelStatus::Delivered { .. }
        ));
        assert_eq!(channel_result.attempts, 1);
    }
    assert_eq!(sms.calls(), 1);
    assert_eq!(email.calls(), 1);
}

#[tokio::test]
async fn transient_failures_retry_until_delivered() {
    let sms = MockChannel::flaky("sms", 2);
    let harness = harness(
        test_config(),
        vec![severity_rule("r1", Severity::Info, &["sms"])],
        RateLimitManager::unlimited(),
        vec![sms.clone()],
    );

    let result = harness
        .service
        .dispatch(request("req-1", Severity::Error))
        .await
        .unwrap();

    assert!(matches!(
        result.channel_results[0].status,
        ChannelStatus::Delivered { .. }
    ));
    assert_eq!(result.channel_results[0].attempts, 3);
    assert_eq!(sms.calls(), 3);

    // The tracker shows the full attempt lifecycle in order.
    let history = harness.tracker.history("req-1").await;
    let outcomes: Vec<AttemptOutcome> = history.iter().map(|a| a.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            AttemptOutcome::Failed,
            AttemptOutcome::Failed,
            AttemptOutcome::Delivered
        ]
    );
    let numbers: Vec<u32> = history.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
}

#[tokio::test]
async fn exhausted_retries_dead_letter_the_delivery() {
    let sms = MockChannel::flaky("sms", 100);
    let harness = harness(
        test_config(),
        vec![severity_rule("r1", Severity::Info, &["sms"])],
        RateLimitManager::unlimited(),
        vec![sms.clone()],
    );

    let result = harness
        .service
        .dispatch(request("req-1", Severity::Error))
        .await
        .unwrap();

    assert_eq!(result.channel_results[0].status, ChannelStatus::Exhausted);
    assert_eq!(result.channel_results[0].attempts, 3);

    let history = harness.tracker.history("req-1").await;
    assert_eq!(history.last().unwrap().outcome, AttemptOutcome::Exhausted);

    let dead_letters = harness.service.dead_letters();
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters[0].channel, "sms");

    // Once the provider recovers, operator replay delivers and keeps
    // attempt numbering monotonic.
    sms.transient_failures.store(0, Ordering::SeqCst);
    let replayed = harness
        .service
        .retry_dead_letter(dead_letters[0].id)
        .await
        .unwrap();
    assert!(matches!(replayed.status, ChannelStatus::Delivered { .. }));
    assert!(harness.service.dead_letters().is_empty());

    let history = harness.tracker.history("req-1").await;
    let numbers: Vec<u32> = history.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn permanent_failures_are_not_retried() {
    let sms = MockChannel::rejecting("sms");
    let harness = harness(
        test_config(),
        vec![severity_rule("r1", Severity::Info, &["sms"])],
        RateLimitManager::unlimited(),
        vec![sms.clone()],
    );

    let result = harness
        .service
        .dispatch(request("req-1", Severity::Error))
        .await
        .unwrap();

    assert!(matches!(
        result.channel_results[0].status,
        ChannelStatus::Failed { .. }
    ));
    assert_eq!(sms.calls(), 1);

    let history = harness.tracker.history("req-1").await;
    let outcomes: Vec<AttemptOutcome> = history.iter().map(|a| a.outcome).collect();
    assert_eq!(
        outcomes,
        vec![AttemptOutcome::Failed, AttemptOutcome::Exhausted]
    );
}

#[tokio::test]
async fn render_failures_are_terminal_without_any_send() {
    let sms = MockChannel::reliable("sms");
    let harness = harness(
        test_config(),
        vec![severity_rule("r1", Severity::Info, &["sms"])],
        RateLimitManager::unlimited(),
        vec![sms.clone()],
    );

    // "alert" needs {level} in the context; leave it out.
    let mut bad = request("req-1", Severity::Error);
    bad.template_id = "alert".to_string();

    let result = harness.service.dispatch(bad).await.unwrap();
    assert!(matches!(
        result.channel_results[0].status,
        ChannelStatus::Failed { .. }
    ));
    assert_eq!(result.channel_results[0].attempts, 0);
    assert_eq!(sms.calls(), 0);
}

#[tokio::test]
async fn rate_limited_channel_reports_retry_hint() {
    let sms = MockChannel::reliable("sms");
    let mut limits = HashMap::new();
    limits.insert("sms".to_string(), LimiterConfig::token_bucket(5, 5.0 / 60.0));
    let harness = harness(
        test_config(),
        vec![severity_rule("r1", Severity::Info, &["sms"])],
        RateLimitManager::new(limits).unwrap(),
        vec![sms.clone()],
    );

    // Six dispatches well inside one refill period: the burst allowance
    // admits five, the sixth is denied with a positive hint.
    for i in 1..=5 {
        let result = harness
            .service
            .dispatch(request(&format!("req-{i}"), Severity::Error))
            .await
            .unwrap();
        assert!(
            matches!(result.channel_results[0].status, ChannelStatus::Delivered { .. }),
            "dispatch {i} should be admitted"
        );
    }

    let result = harness
        .service
        .dispatch(request("req-6", Severity::Error))
        .await
        .unwrap();
    match &result.channel_results[0].status {
        ChannelStatus::RateLimited { retry_after_ms } => assert!(*retry_after_ms > 0),
        other => panic!("expected rate limited, got {other:?}"),
    }
    assert_eq!(sms.calls(), 5);

    let history = harness.tracker.history("req-6").await;
    let outcomes: Vec<AttemptOutcome> = history.iter().map(|a| a.outcome).collect();
    assert_eq!(
        outcomes,
        vec![AttemptOutcome::RateLimited, AttemptOutcome::Exhausted]
    );
}

#[tokio::test]
async fn no_matching_rule_still_fans_out_webhooks() {
    let sms = MockChannel::reliable("sms");
    let harness = harness(
        test_config(),
        vec![severity_rule("r1", Severity::Critical, &["sms"])],
        RateLimitManager::unlimited(),
        vec![sms.clone()],
    );
    harness
        .service
        .webhooks()
        .register(WebhookEndpoint::new("https://hooks.test/a", "secret"));

    let result = harness
        .service
        .dispatch(request("req-1", Severity::Info))
        .await
        .unwrap();

    assert!(result.route_decision.is_empty());
    assert!(result.channel_results.is_empty());
    assert_eq!(sms.calls(), 0);

    // The webhook fan-out is evaluated independently of the empty plan.
    assert_eq!(result.webhook_results.len(), 1);
    assert_eq!(
        result.webhook_results[0].status,
        WebhookStatus::Delivered { http_status: 200 }
    );
    assert_eq!(harness.transport.call_count(), 1);
}

#[tokio::test]
async fn webhook_filters_gate_fanout_by_severity() {
    let harness = harness(
        test_config(),
        Vec::new(),
        RateLimitManager::unlimited(),
        Vec::new(),
    );
    harness.service.webhooks().register(
        WebhookEndpoint::new("https://hooks.test/a", "secret").with_filter(WebhookFilter {
            min_severity: Severity::Warning,
            tags: Default::default(),
        }),
    );

    let info = harness
        .service
        .dispatch(request("req-info", Severity::Info))
        .await
        .unwrap();
    assert!(info.webhook_results.is_empty());
    assert_eq!(harness.transport.call_count(), 0);

    let critical = harness
        .service
        .dispatch(request("req-critical", Severity::Critical))
        .await
        .unwrap();
    assert_eq!(critical.webhook_results.len(), 1);
    assert_eq!(harness.transport.call_count(), 1);
}

#[tokio::test]
async fn duplicate_dispatch_inside_dedupe_window_has_no_new_side_effects() {
    let sms = MockChannel::reliable("sms");
    let harness = harness(
        test_config(),
        vec![severity_rule("r1", Severity::Info, &["sms"])],
        RateLimitManager::unlimited(),
        vec![sms.clone()],
    );
    harness
        .service
        .webhooks()
        .register(WebhookEndpoint::new("https://hooks.test/a", "secret"));

    let first = harness
        .service
        .dispatch(request("req-1", Severity::Error))
        .await
        .unwrap();
    let second = harness
        .service
        .dispatch(request("req-1", Severity::Error))
        .await
        .unwrap();

    // One set of side effects, identical cached outcome.
    assert_eq!(sms.calls(), 1);
    assert_eq!(harness.transport.call_count(), 1);
    assert_eq!(harness.tracker.history("req-1").await.len(), 1);
    assert_eq!(first.completed_at, second.completed_at);
    assert_eq!(first.channel_results.len(), second.channel_results.len());
}

#[tokio::test]
async fn deadline_stops_retries_but_lets_inflight_sends_finish() {
    let sms = MockChannel::slow("sms", Duration::from_millis(40), 100);
    let config = ServiceConfig {
        request_deadline_ms: 20,
        ..test_config()
    };
    let harness = harness(
        config,
        vec![severity_rule("r1", Severity::Info, &["sms"])],
        RateLimitManager::unlimited(),
        vec![sms.clone()],
    );

    let result = harness
        .service
        .dispatch(request("req-1", Severity::Error))
        .await
        .unwrap();

    // The first attempt ran to completion past the deadline; no retry
    // was scheduled after it.
    assert_eq!(result.channel_results[0].status, ChannelStatus::TimedOut);
    assert_eq!(sms.calls(), 1);

    let history = harness.tracker.history("req-1").await;
    assert_eq!(history.last().unwrap().outcome, AttemptOutcome::Exhausted);
}

#[tokio::test]
async fn malformed_requests_fail_synchronously() {
    let harness = harness(
        test_config(),
        Vec::new(),
        RateLimitManager::unlimited(),
        Vec::new(),
    );

    let mut bad = request("", Severity::Info);
    bad.recipient = String::new();
    assert!(harness.service.dispatch(bad).await.is_err());
}

#[tokio::test]
async fn stats_reflect_registered_components() {
    let sms = MockChannel::reliable("sms");
    let harness = harness(
        test_config(),
        vec![severity_rule("r1", Severity::Info, &["sms"])],
        RateLimitManager::unlimited(),
        vec![sms],
    );
    harness
        .service
        .webhooks()
        .register(WebhookEndpoint::new("https://hooks.test/a", "secret"));

    harness
        .service
        .dispatch(request("req-1", Severity::Error))
        .await
        .unwrap();

    let stats = harness.service.stats();
    assert_eq!(stats.channels, 1);
    assert_eq!(stats.webhook_endpoints, 1);
    assert_eq!(stats.dead_letters, 0);
}
