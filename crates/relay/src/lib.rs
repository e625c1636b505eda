//! # Relay Engine
//!
//! Multi-channel notification dispatch: an incoming alert is routed to
//! delivery channels by configured rules, each send is gated by per-key
//! rate limits and retried with backoff, every attempt is tracked, and
//! the request is independently fanned out to signed webhook
//! subscribers.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use relay_engine::router::{RouteMode, RoutingRuleBuilder, SmartRouter};
//! use relay_engine::service::{NotificationService, ServiceConfig};
//! use relay_engine::tracker::MemoryTracker;
//! use relay_engine::webhook::{WebhookDispatchConfig, WebhookManager};
//! use relay_engine::Severity;
//! use relay_engine::throttle::RateLimitManager;
//!
//! # fn templates() -> Arc<dyn relay_engine::TemplateEngine> { unimplemented!() }
//! let router = SmartRouter::new(vec![
//!     RoutingRuleBuilder::new("page-oncall", 10)
//!         .min_severity(Severity::Critical)
//!         .channels(["sms", "voice"])
//!         .mode(RouteMode::FirstMatch)
//!         .build(),
//! ]);
//!
//! let service = NotificationService::new(
//!     ServiceConfig::default(),
//!     router,
//!     Arc::new(RateLimitManager::unlimited()),
//!     templates(),
//!     Arc::new(MemoryTracker::default()),
//!     Arc::new(WebhookManager::new(WebhookDispatchConfig::default())),
//! );
//! ```

pub use throttle;

pub mod channel;
pub mod error;
pub mod request;
pub mod retry;
pub mod router;
pub mod service;
pub mod template;
pub mod tracker;
pub mod webhook;

pub use channel::{Channel, ProviderReceipt, SendError};
pub use error::{Error, Result};
pub use request::{NotificationRequest, Severity};
pub use retry::RetryPolicy;
pub use router::{RouteDecision, RoutingRule, RoutingRuleBuilder, SmartRouter};
pub use service::{NotificationResult, NotificationService, ServiceConfig};
pub use template::{TemplateEngine, TemplateError};
pub use tracker::{DeliveryAttempt, DeliveryTracker, MemoryTracker, SqliteTracker};
pub use webhook::{WebhookEndpoint, WebhookManager};
