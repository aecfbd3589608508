//! Subscription reconciler
//!
//! Applies a desired billing state computed from provider facts to local
//! storage. Every write is last-write-wins and idempotent, so applying the same
//! state twice leaves the same accounts and records behind. This is what lets
//! the webhook path, checkout confirmation and cancellation all apply the same
//! transition without coordinating.

use std::sync::Arc;

use estate_shared::{SubscriptionPlan, SubscriptionStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::outcome::{StepKind, StepOutcome};
use crate::store::{
    AccountBillingUpdate, BillingStore, RecordKey, SubscriptionRecordWrite, TrialEnd,
};
use crate::target::Target;

/// Billing state to converge on
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredState {
    pub status: SubscriptionStatus,
    /// `None` keeps the current plan
    pub plan: Option<SubscriptionPlan>,
    pub trial_end: TrialEnd,
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: Option<String>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancelled_at: Option<OffsetDateTime>,
}

impl DesiredState {
    pub fn new(status: SubscriptionStatus) -> Self {
        Self {
            status,
            plan: None,
            trial_end: TrialEnd::Unchanged,
            provider_customer_id: None,
            provider_subscription_id: None,
            current_period_end: None,
            cancelled_at: None,
        }
    }

    /// Fully cancelled, back on the free plan
    pub fn cancelled(cancelled_at: OffsetDateTime) -> Self {
        Self {
            plan: Some(SubscriptionPlan::FreeTrial),
            trial_end: TrialEnd::Clear,
            cancelled_at: Some(cancelled_at),
            ..Self::new(SubscriptionStatus::Cancelled)
        }
    }

    pub fn with_provider_ids(
        mut self,
        customer_id: Option<String>,
        subscription_id: Option<String>,
    ) -> Self {
        self.provider_customer_id = customer_id;
        self.provider_subscription_id = subscription_id;
        self
    }

    fn account_update(&self) -> AccountBillingUpdate {
        AccountBillingUpdate {
            status: self.status,
            plan: self.plan,
            trial_end: self.trial_end,
        }
    }

    fn record_write(&self) -> SubscriptionRecordWrite {
        SubscriptionRecordWrite {
            plan: self.plan,
            status: Some(self.status),
            provider_customer_id: self.provider_customer_id.clone(),
            provider_subscription_id: self.provider_subscription_id.clone(),
            current_period_end: self.current_period_end,
            cancelled_at: self.cancelled_at,
        }
    }
}

/// Result of reconciling one target
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileOutcome {
    /// Accounts the target expanded to
    pub account_ids: Vec<Uuid>,
    /// Account and record steps, tagged with their account id
    pub steps: Vec<StepOutcome>,
}

impl ReconcileOutcome {
    pub fn has_failures(&self) -> bool {
        self.steps.iter().any(StepOutcome::is_failed)
    }
}

pub struct SubscriptionReconciler {
    store: Arc<dyn BillingStore>,
}

impl SubscriptionReconciler {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Expand a target into concrete account ids
    pub async fn expand_target(&self, target: Target) -> BillingResult<Vec<Uuid>> {
        match target {
            Target::Account(id) => Ok(vec![id]),
            Target::Organization(org_id) => self.store.organization_member_ids(org_id).await,
        }
    }

    /// Converge every account of `target` on `desired`
    ///
    /// Only a failure to expand the target is returned as an error. Account
    /// and record writes are attempted independently for each account and
    /// their failures are reported as failed steps.
    pub async fn reconcile(
        &self,
        target: Target,
        desired: &DesiredState,
    ) -> BillingResult<ReconcileOutcome> {
        let account_ids = self.expand_target(target).await?;

        if account_ids.is_empty() {
            tracing::warn!(target = %target, "Reconcile target has no accounts");
        }

        let mut outcome = ReconcileOutcome {
            account_ids: account_ids.clone(),
            steps: Vec::with_capacity(account_ids.len() * 2),
        };

        for account_id in account_ids {
            let account_step = self.update_account(account_id, desired).await;
            let account_missing = matches!(
                &account_step.status,
                crate::outcome::StepStatus::Skipped(_)
            );
            outcome.steps.push(account_step.for_account(account_id));

            let record_step = if account_missing {
                StepOutcome::skipped(StepKind::WriteSubscriptionRecord, "account not found")
            } else {
                self.write_record(account_id, desired).await
            };
            outcome.steps.push(record_step.for_account(account_id));
        }

        tracing::info!(
            target = %target,
            status = %desired.status,
            plan = ?desired.plan,
            accounts = outcome.account_ids.len(),
            failures = outcome.has_failures(),
            "Reconciled billing state"
        );

        Ok(outcome)
    }

    async fn update_account(&self, account_id: Uuid, desired: &DesiredState) -> StepOutcome {
        match self
            .store
            .update_account_billing(account_id, &desired.account_update())
            .await
        {
            Ok(true) => StepOutcome::succeeded(StepKind::UpdateAccount),
            Ok(false) => {
                tracing::warn!(account_id = %account_id, "Account not found during reconcile");
                StepOutcome::skipped(StepKind::UpdateAccount, "account not found")
            }
            Err(e) => {
                tracing::error!(
                    account_id = %account_id,
                    error = %e,
                    "Failed to update account billing state"
                );
                StepOutcome::failed(StepKind::UpdateAccount, e.to_string())
            }
        }
    }

    async fn write_record(&self, account_id: Uuid, desired: &DesiredState) -> StepOutcome {
        match self.try_write_record(account_id, desired).await {
            Ok(step) => step,
            Err(e) => {
                tracing::error!(
                    account_id = %account_id,
                    subscription_id = ?desired.provider_subscription_id,
                    error = %e,
                    "Failed to write subscription record"
                );
                StepOutcome::failed(StepKind::WriteSubscriptionRecord, e.to_string())
            }
        }
    }

    async fn try_write_record(
        &self,
        account_id: Uuid,
        desired: &DesiredState,
    ) -> BillingResult<StepOutcome> {
        let write = desired.record_write();
        let subscription_id = desired.provider_subscription_id.as_deref();
        let customer_id = desired.provider_customer_id.as_deref();

        let mut existing = None;
        if let Some(id) = subscription_id {
            existing = self
                .store
                .find_account_record(account_id, RecordKey::SubscriptionId(id))
                .await?;
        }
        if existing.is_none() {
            if let Some(id) = customer_id {
                existing = self
                    .store
                    .find_account_record(account_id, RecordKey::CustomerId(id))
                    .await?;
            }
        }
        if existing.is_none() && !write.has_provider_ids() {
            existing = self
                .store
                .find_account_record(account_id, RecordKey::Latest)
                .await?;
        }

        match existing {
            Some(record) => {
                self.store.update_subscription_record(record.id, &write).await?;
                Ok(StepOutcome::succeeded(StepKind::WriteSubscriptionRecord))
            }
            None if write.has_provider_ids() => {
                let record = self
                    .store
                    .create_subscription_record(account_id, &write)
                    .await?;
                tracing::debug!(
                    account_id = %account_id,
                    record_id = %record.id,
                    "Subscription record created"
                );
                Ok(StepOutcome::succeeded(StepKind::WriteSubscriptionRecord))
            }
            None => Ok(StepOutcome::skipped(
                StepKind::WriteSubscriptionRecord,
                "no record and no provider identifiers",
            )),
        }
    }
}
