//! Subscription confirmation and cancellation
//!
//! Both operations apply the same transition the webhook will deliver later.
//! The reconciler is idempotent, so the duplicate application is harmless and
//! the UI does not have to wait for the webhook.

use std::sync::Arc;

use estate_shared::{SubscriptionPlan, SubscriptionStatus};
use serde::Serialize;
use time::OffsetDateTime;

use crate::catalog::PlanCatalog;
use crate::dispatcher::desired_state_for_checkout;
use crate::error::{BillingError, BillingResult};
use crate::provider::PaymentProvider;
use crate::reconciler::{DesiredState, SubscriptionReconciler};
use crate::store::{Account, BillingStore, RecordKey};
use crate::target::{Target, TargetHints, TargetResolver};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfirmResult {
    pub ok: bool,
    pub plan: SubscriptionPlan,
    pub status: SubscriptionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResult {
    pub success: bool,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancel_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
}

fn timestamp(secs: Option<i64>) -> Option<OffsetDateTime> {
    secs.and_then(|s| OffsetDateTime::from_unix_timestamp(s).ok())
}

pub struct SubscriptionService {
    provider: Arc<dyn PaymentProvider>,
    store: Arc<dyn BillingStore>,
    catalog: PlanCatalog,
    resolver: TargetResolver,
    reconciler: SubscriptionReconciler,
}

impl SubscriptionService {
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        store: Arc<dyn BillingStore>,
        catalog: PlanCatalog,
    ) -> Self {
        Self {
            resolver: TargetResolver::new(store.clone()),
            reconciler: SubscriptionReconciler::new(store.clone()),
            provider,
            store,
            catalog,
        }
    }

    /// Apply a desired state, logging instead of failing the request
    async fn reconcile_best_effort(&self, target: Target, desired: &DesiredState) {
        match self.reconciler.reconcile(target, desired).await {
            Ok(outcome) if outcome.has_failures() => {
                tracing::warn!(
                    target = %target,
                    steps = ?outcome.steps,
                    "Reconcile partially failed, webhook delivery will repair it"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(
                    target = %target,
                    error = %e,
                    "Reconcile failed, webhook delivery will repair it"
                );
            }
        }
    }

    /// Confirm a completed checkout session for the calling account
    pub async fn confirm_checkout(
        &self,
        caller: &Account,
        session_id: &str,
    ) -> BillingResult<ConfirmResult> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(BillingError::InvalidInput("sessionId is required".to_string()));
        }

        let session = self.provider.retrieve_checkout_session(session_id).await?;
        if !session.is_complete() {
            return Err(BillingError::SessionIncomplete(format!(
                "checkout session {} is {}",
                session.id,
                session.status.as_deref().unwrap_or("open")
            )));
        }

        let resolution = self
            .resolver
            .resolve(TargetHints {
                metadata: Some(&session.metadata),
                customer_id: session.customer_id.as_deref(),
                subscription_id: None,
                email: session.customer_email.as_deref(),
            })
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("no account for checkout session {}", session.id))
            })?;

        if !resolution.target.covers(caller) {
            tracing::warn!(
                account_id = %caller.id,
                session_id = %session.id,
                target = %resolution.target,
                "Rejected confirmation of another account's checkout session"
            );
            return Err(BillingError::Forbidden(
                "checkout session belongs to a different account".to_string(),
            ));
        }

        let subscription = match session.subscription_id.as_deref() {
            Some(id) => Some(self.provider.retrieve_subscription(id).await?),
            None => None,
        };

        let desired = desired_state_for_checkout(&session, subscription.as_ref(), &self.catalog);
        self.reconcile_best_effort(resolution.target, &desired).await;

        tracing::info!(
            account_id = %caller.id,
            session_id = %session.id,
            status = %desired.status,
            plan = ?desired.plan,
            "Checkout confirmed"
        );

        Ok(ConfirmResult {
            ok: true,
            plan: desired.plan.unwrap_or(caller.subscription_plan),
            status: desired.status,
        })
    }

    /// Cancel the caller's current subscription, now or at period end
    pub async fn cancel_subscription(
        &self,
        caller: &Account,
        immediate: bool,
    ) -> BillingResult<CancelResult> {
        let record = self
            .store
            .find_account_record(caller.id, RecordKey::Latest)
            .await?
            .ok_or(BillingError::SubscriptionNotFound)?;

        if record.status == SubscriptionStatus::Cancelled {
            return Err(BillingError::AlreadyCancelled);
        }
        let subscription_id = record
            .provider_subscription_id
            .as_deref()
            .ok_or(BillingError::SubscriptionNotFound)?;

        let subscription = self
            .provider
            .cancel_subscription(subscription_id, immediate)
            .await?;

        if immediate {
            let cancelled_at =
                timestamp(subscription.canceled_at).unwrap_or_else(OffsetDateTime::now_utc);
            let desired = DesiredState::cancelled(cancelled_at).with_provider_ids(
                record.provider_customer_id.clone(),
                Some(subscription.id.clone()),
            );
            // The provider cancellation stands even if this fails
            self.reconcile_best_effort(Target::for_account(caller), &desired)
                .await;
        }

        tracing::info!(
            account_id = %caller.id,
            subscription_id = %subscription.id,
            immediate = immediate,
            "Cancelled subscription"
        );

        Ok(CancelResult {
            success: true,
            cancel_at_period_end: subscription.cancel_at_period_end,
            cancel_at: timestamp(subscription.cancel_at)
                .or_else(|| immediate.then(OffsetDateTime::now_utc)),
            current_period_end: timestamp(subscription.current_period_end)
                .or(record.current_period_end),
        })
    }
}
