//! Routing rules and the smart router.
//!
//! Rules are configured data: evaluated in ascending priority order at
//! dispatch time, never mutated. A rule matches when every configured
//! predicate fragment holds (fragments are ANDed). `FirstMatch` rules end
//! evaluation; `Accumulate` rules contribute their channels and let
//! evaluation continue.

mod builder;

pub use builder::RoutingRuleBuilder;

use std::collections::BTreeSet;

use chrono::Timelike;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::request::{NotificationRequest, Severity};

/// What a matching rule does to the remaining evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteMode {
    /// Stop at this rule; the decision holds only its channels.
    FirstMatch,
    /// Contribute channels and keep evaluating lower-priority rules.
    Accumulate,
}

/// Predicate fragments of a routing rule, combined with logical AND.
/// An empty fragment set matches every request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulePredicate {
    /// Minimum severity (inclusive).
    #[serde(default)]
    pub min_severity: Option<Severity>,
    /// Request must carry at least one of these tags.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Request recipient must be one of these.
    #[serde(default)]
    pub recipients: BTreeSet<String>,
    /// Request creation hour (UTC) must fall in `[start, end)`;
    /// `start > end` wraps past midnight.
    #[serde(default)]
    pub hours_utc: Option<(u8, u8)>,
}

impl RulePredicate {
    /// Whether every configured fragment holds for the request.
    pub fn matches(&self, request: &NotificationRequest) -> bool {
        if let Some(min) = self.min_severity {
            if request.severity < min {
                return false;
            }
        }

        if !self.tags.is_empty() && self.tags.is_disjoint(&request.tags) {
            return false;
        }

        if !self.recipients.is_empty() && !self.recipients.contains(&request.recipient) {
            return false;
        }

        if let Some((start, end)) = self.hours_utc {
            let hour = request.created_at.hour() as u8;
            let in_range = if start <= end {
                hour >= start && hour < end
            } else {
                hour >= start || hour < end
            };
            if !in_range {
                return false;
            }
        }

        true
    }
}

/// A configured predicate-to-channels mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: String,
    /// Lower sorts first.
    pub priority: u32,
    pub predicate: RulePredicate,
    /// Channels this rule routes to, in order.
    pub channels: Vec<String>,
    pub mode: RouteMode,
}

/// One planned channel send, with the rule that put it in the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedSend {
    pub channel: String,
    pub rule_id: String,
}

/// The channel plan for one request. An empty plan is a valid,
/// reportable outcome, not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub planned: Vec<PlannedSend>,
}

impl RouteDecision {
    pub fn is_empty(&self) -> bool {
        self.planned.is_empty()
    }
}

/// Evaluates routing rules against incoming requests.
pub struct SmartRouter {
    /// Rules sorted by ascending priority at construction.
    rules: Vec<RoutingRule>,
}

impl SmartRouter {
    pub fn new(mut rules: Vec<RoutingRule>) -> Self {
        rules.sort_by_key(|rule| rule.priority);
        Self { rules }
    }

    /// Produce the channel plan for a request.
    ///
    /// Channels are deduplicated preserving first-seen order, so when two
    /// matching rules name the same channel the earliest (highest
    /// priority) rule keeps the association.
    pub fn route(&self, request: &NotificationRequest) -> RouteDecision {
        let mut planned: Vec<PlannedSend> = Vec::new();
        let mut seen: BTreeSet<&str> = BTreeSet::new();

        for rule in &self.rules {
            if !rule.predicate.matches(request) {
                continue;
            }

            debug!(rule = %rule.id, request = %request.id, "routing rule matched");
            for channel in &rule.channels {
                if seen.insert(channel.as_str()) {
                    planned.push(PlannedSend {
                        channel: channel.clone(),
                        rule_id: rule.id.clone(),
                    });
                }
            }

            if rule.mode == RouteMode::FirstMatch {
                break;
            }
        }

        RouteDecision { planned }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}
