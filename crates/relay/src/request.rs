//! Notification requests and severity levels.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Severity level of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational only.
    Info,
    /// Something worth looking at.
    Warning,
    /// Something went wrong.
    Error,
    /// Requires immediate attention.
    Critical,
}

impl Default for Severity {
    fn default() -> Self {
        Self::Info
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// An incoming alert/event to dispatch.
///
/// Immutable once created. `id` is the caller-supplied idempotency key:
/// dispatching the same id twice inside the dedupe window returns the
/// cached result instead of re-sending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    /// Caller-supplied idempotency key.
    pub id: String,
    /// Severity of the underlying event.
    pub severity: Severity,
    /// Free-form routing/filtering tags.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Opaque recipient identifier.
    pub recipient: String,
    /// Key/value data handed to the template renderer.
    #[serde(default)]
    pub payload_context: HashMap<String, serde_json::Value>,
    /// Template used to render the per-channel payload.
    pub template_id: String,
    /// When the request was created.
    pub created_at: DateTime<Utc>,
}

impl NotificationRequest {
    /// Build a request with the current timestamp.
    pub fn new(
        id: impl Into<String>,
        severity: Severity,
        recipient: impl Into<String>,
        template_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            severity,
            tags: BTreeSet::new(),
            recipient: recipient.into(),
            payload_context: HashMap::new(),
            template_id: template_id.into(),
            created_at: Utc::now(),
        }
    }

    /// Add a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Add a template context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload_context.insert(key.into(), value);
        self
    }

    /// Reject requests missing required fields. The only condition a
    /// dispatch call reports synchronously.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::validation("request id must not be empty"));
        }
        if self.recipient.trim().is_empty() {
            return Err(Error::validation("request recipient must not be empty"));
        }
        if self.template_id.trim().is_empty() {
            return Err(Error::validation("request template_id must not be empty"));
        }
        Ok(())
    }
}
