//! Fluent construction of routing rules.

use crate::request::Severity;

use super::{RouteMode, RoutingRule, RulePredicate};

/// Accumulates predicate fragments and yields an immutable
/// [`RoutingRule`]. Fragments combine with logical AND; `build()`
/// consumes the builder, so state is never shared across rules.
///
/// ```
/// use relay_engine::router::{RouteMode, RoutingRuleBuilder};
/// use relay_engine::Severity;
///
/// let rule = RoutingRuleBuilder::new("page-oncall", 10)
///     .min_severity(Severity::Critical)
///     .any_tag(["prod"])
///     .channels(["sms", "voice"])
///     .mode(RouteMode::FirstMatch)
///     .build();
/// assert_eq!(rule.channels, vec!["sms", "voice"]);
/// ```
#[derive(Debug)]
pub struct RoutingRuleBuilder {
    id: String,
    priority: u32,
    predicate: RulePredicate,
    channels: Vec<String>,
    mode: RouteMode,
}

impl RoutingRuleBuilder {
    pub fn new(id: impl Into<String>, priority: u32) -> Self {
        Self {
            id: id.into(),
            priority,
            predicate: RulePredicate::default(),
            channels: Vec::new(),
            mode: RouteMode::Accumulate,
        }
    }

    /// Require `severity >= min`.
    pub fn min_severity(mut self, min: Severity) -> Self {
        self.predicate.min_severity = Some(min);
        self
    }

    /// Require at least one of `tags` on the request. Multiple calls
    /// extend the set.
    pub fn any_tag<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.predicate.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Require the recipient to be one of `recipients`. Multiple calls
    /// extend the set.
    pub fn recipient_in<I, S>(mut self, recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.predicate
            .recipients
            .extend(recipients.into_iter().map(Into::into));
        self
    }

    /// Require the request's UTC creation hour to fall in `[start, end)`;
    /// `start > end` wraps past midnight.
    pub fn between_hours_utc(mut self, start: u8, end: u8) -> Self {
        self.predicate.hours_utc = Some((start, end));
        self
    }

    /// The channels this rule routes to, in order.
    pub fn channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels.extend(channels.into_iter().map(Into::into));
        self
    }

    pub fn mode(mut self, mode: RouteMode) -> Self {
        self.mode = mode;
        self
    }

    /// Yield the immutable rule.
    pub fn build(self) -> RoutingRule {
        RoutingRule {
            id: self.id,
            priority: self.priority,
            predicate: self.predicate,
            channels: self.channels,
            mode: self.mode,
        }
    }
}
