//! Decides which feeds run for a submission and which notifications wait.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{ConditionOperator, ConditionRule, Entry, FeedCondition, FeedConfig, Form, LogicType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDecision {
    pub qualifies: bool,
}

/// Notification events held back until the last queued feed finishes.
/// Keeps first-seen order and ignores repeats.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SuppressedNotificationSet {
    events: Vec<String>,
}

impl SuppressedNotificationSet {
    /// Returns false when the event was already held.
    pub fn suppress(&mut self, event: &str) -> bool {
        if self.events.iter().any(|e| e == event) {
            return false;
        }
        self.events.push(event.to_string());
        true
    }

    pub fn events(&self) -> &[String] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn into_events(self) -> Vec<String> {
        self.events
    }
}

impl FromIterator<String> for SuppressedNotificationSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        let mut set = Self::default();
        for event in iter {
            set.suppress(&event);
        }
        set
    }
}

pub struct FeedGate;

impl FeedGate {
    /// A feed qualifies when it is active, its condition passes, and at least
    /// one upload-capable field selected by it has a non-blank value.
    pub fn evaluate(feed: &FeedConfig, entry: &Entry, form: &Form) -> GateDecision {
        if !feed.is_active {
            return GateDecision { qualifies: false };
        }
        if !condition_met(&feed.condition, entry) {
            debug!(feed_id = feed.id, entry_id = entry.id, "feed condition not met");
            return GateDecision { qualifies: false };
        }
        let qualifies = form
            .upload_fields()
            .filter(|(field, _)| feed.upload_field.matches(field.id))
            .any(|(field, _)| !entry.is_blank(field.id));
        GateDecision { qualifies }
    }

    /// Hold back every active notification of the form.
    pub fn suppress_notifications(form: &Form, set: &mut SuppressedNotificationSet) {
        for notification in form.notifications.iter().filter(|n| n.is_active) {
            if set.suppress(&notification.event) {
                debug!(form_id = form.id, event = %notification.event, "notification suppressed");
            }
        }
    }
}

pub fn condition_met(condition: &FeedCondition, entry: &Entry) -> bool {
    if !condition.enabled || condition.rules.is_empty() {
        return true;
    }
    let mut results = condition.rules.iter().map(|rule| rule_matches(rule, entry));
    match condition.logic {
        LogicType::All => results.all(|r| r),
        LogicType::Any => results.any(|r| r),
    }
}

fn rule_matches(rule: &ConditionRule, entry: &Entry) -> bool {
    let actual = entry.value(rule.field_id).trim().to_lowercase();
    let expected = rule.value.trim().to_lowercase();
    match rule.operator {
        ConditionOperator::Is => actual == expected,
        ConditionOperator::IsNot => actual != expected,
        ConditionOperator::Contains => actual.contains(&expected),
        ConditionOperator::StartsWith => actual.starts_with(&expected),
        ConditionOperator::EndsWith => actual.ends_with(&expected),
        ConditionOperator::GreaterThan | ConditionOperator::LessThan => {
            let (Ok(a), Ok(b)) = (actual.parse::<f64>(), expected.parse::<f64>()) else {
                return false;
            };
            if rule.operator == ConditionOperator::GreaterThan {
                a > b
            } else {
                a < b
            }
        }
    }
}
