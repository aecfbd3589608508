//! Per-event outcome records
//!
//! Best-effort side effects report what happened instead of only logging, so
//! callers and tests can tell "notification failed but reconciliation
//! succeeded" apart from a clean run.

use serde::Serialize;

use crate::target::Target;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    ResolveTarget,
    FetchSubscription,
    UpdateAccount,
    WriteSubscriptionRecord,
    Notify,
    IncrementPromoUsage,
}

impl StepKind {
    /// Whether a failure of this step leaves local state behind the provider
    pub fn failure_requires_replay(&self) -> bool {
        matches!(self, StepKind::UpdateAccount | StepKind::WriteSubscriptionRecord)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub step: StepKind,
    /// Account the step applied to, for per-member steps of a fan-out
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<uuid::Uuid>,
    #[serde(flatten)]
    pub status: StepStatus,
}

impl StepOutcome {
    pub fn succeeded(step: StepKind) -> Self {
        Self {
            step,
            account_id: None,
            status: StepStatus::Succeeded,
        }
    }

    pub fn skipped(step: StepKind, reason: impl Into<String>) -> Self {
        Self {
            step,
            account_id: None,
            status: StepStatus::Skipped(reason.into()),
        }
    }

    pub fn failed(step: StepKind, reason: impl Into<String>) -> Self {
        Self {
            step,
            account_id: None,
            status: StepStatus::Failed(reason.into()),
        }
    }

    pub fn for_account(mut self, account_id: uuid::Uuid) -> Self {
        self.account_id = Some(account_id);
        self
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, StepStatus::Failed(_))
    }
}

/// Everything that happened while handling one event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventOutcome {
    pub event_id: String,
    pub event_type: String,
    pub target: Option<Target>,
    pub steps: Vec<StepOutcome>,
}

impl EventOutcome {
    pub fn new(event_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            event_type: event_type.into(),
            target: None,
            steps: Vec::new(),
        }
    }

    pub fn push(&mut self, step: StepOutcome) {
        self.steps.push(step);
    }

    pub fn extend(&mut self, steps: impl IntoIterator<Item = StepOutcome>) {
        self.steps.extend(steps);
    }

    /// Outcomes recorded for one kind of step
    pub fn steps_of(&self, kind: StepKind) -> impl Iterator<Item = &StepOutcome> {
        self.steps.iter().filter(move |s| s.step == kind)
    }

    pub fn has_failures(&self) -> bool {
        self.steps.iter().any(StepOutcome::is_failed)
    }

    /// True when local state may be behind the provider and the event should be
    /// handled again
    pub fn requires_replay(&self) -> bool {
        self.steps
            .iter()
            .any(|s| s.is_failed() && s.step.failure_requires_replay())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_state_failures_require_replay() {
        let mut outcome = EventOutcome::new("evt_1", "invoice.payment_failed");
        outcome.push(StepOutcome::succeeded(StepKind::ResolveTarget));
        outcome.push(StepOutcome::failed(StepKind::Notify, "smtp down"));
        outcome.push(StepOutcome::failed(StepKind::IncrementPromoUsage, "db"));
        assert!(outcome.has_failures());
        assert!(!outcome.requires_replay());

        outcome.push(StepOutcome::failed(StepKind::UpdateAccount, "db"));
        assert!(outcome.requires_replay());
    }

    #[test]
    fn test_step_outcome_serializes_flat() {
        let step = StepOutcome::skipped(StepKind::WriteSubscriptionRecord, "no provider ids");
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["step"], "write_subscription_record");
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["reason"], "no provider ids");
    }
}
