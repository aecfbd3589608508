//! Webhook event dispatcher
//!
//! One arm per event kind. Each arm resolves the target, computes the desired
//! billing state from authoritative provider data and hands it to the
//! reconciler. Events that cannot be tied to an account are skipped, never
//! failed.

use std::sync::Arc;

use estate_shared::{SubscriptionPlan, SubscriptionStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::email::{NotificationContext, Notifier};
use crate::error::BillingResult;
use crate::events::{EventPayload, InvoiceSummary, ScheduleSummary, StripeEvent};
use crate::outcome::{EventOutcome, StepKind, StepOutcome};
use crate::provider::{PaymentProvider, ProviderCheckoutSession, ProviderSubscription};
use crate::reconciler::{DesiredState, SubscriptionReconciler};
use crate::status::map_status;
use crate::store::{BillingStore, TrialEnd};
use crate::target::{Resolution, TargetHints, TargetResolver, META_PLAN, META_PROMO_CODE_ID};

fn timestamp(secs: Option<i64>) -> Option<OffsetDateTime> {
    secs.and_then(|s| OffsetDateTime::from_unix_timestamp(s).ok())
}

fn metadata_plan(metadata: &std::collections::HashMap<String, String>) -> Option<SubscriptionPlan> {
    metadata.get(META_PLAN).and_then(|p| p.parse().ok())
}

fn plan_for_subscription(
    subscription: &ProviderSubscription,
    catalog: &PlanCatalog,
) -> Option<SubscriptionPlan> {
    subscription
        .price_id
        .as_deref()
        .and_then(|price| catalog.plan_for_price_id(price))
        .or_else(|| metadata_plan(&subscription.metadata))
}

/// Desired state from a provider subscription
///
/// `fallback` applies when the provider status is missing or unlisted.
pub fn desired_state_for_subscription(
    subscription: &ProviderSubscription,
    catalog: &PlanCatalog,
    fallback: SubscriptionStatus,
) -> DesiredState {
    let status = map_status(subscription.status.as_deref(), fallback);
    let ids = (
        subscription.customer_id.clone(),
        Some(subscription.id.clone()),
    );

    if status == SubscriptionStatus::Cancelled {
        let cancelled_at = timestamp(subscription.canceled_at.or(subscription.ended_at))
            .unwrap_or_else(OffsetDateTime::now_utc);
        return DesiredState {
            current_period_end: timestamp(subscription.current_period_end),
            ..DesiredState::cancelled(cancelled_at)
        }
        .with_provider_ids(ids.0, ids.1);
    }

    let trial_end = match status {
        SubscriptionStatus::Active => TrialEnd::Clear,
        SubscriptionStatus::Trial => timestamp(subscription.trial_end)
            .map(TrialEnd::Set)
            .unwrap_or_default(),
        _ => TrialEnd::Unchanged,
    };

    DesiredState {
        plan: plan_for_subscription(subscription, catalog),
        trial_end,
        current_period_end: timestamp(subscription.current_period_end),
        ..DesiredState::new(status)
    }
    .with_provider_ids(ids.0, ids.1)
}

/// Desired state for a completed checkout
///
/// With the subscription fetched, status and plan come from it; otherwise the
/// plan declared in session metadata is taken as active.
pub fn desired_state_for_checkout(
    session: &ProviderCheckoutSession,
    subscription: Option<&ProviderSubscription>,
    catalog: &PlanCatalog,
) -> DesiredState {
    match subscription {
        Some(subscription) => {
            let mut desired =
                desired_state_for_subscription(subscription, catalog, SubscriptionStatus::Active);
            if desired.plan.is_none() {
                desired.plan = metadata_plan(&session.metadata);
            }
            if session.customer_id.is_some() {
                desired.provider_customer_id = session.customer_id.clone();
            }
            desired
        }
        None => DesiredState {
            plan: metadata_plan(&session.metadata),
            trial_end: TrialEnd::Clear,
            ..DesiredState::new(SubscriptionStatus::Active)
        }
        .with_provider_ids(session.customer_id.clone(), session.subscription_id.clone()),
    }
}

pub struct EventDispatcher {
    provider: Arc<dyn PaymentProvider>,
    store: Arc<dyn BillingStore>,
    catalog: PlanCatalog,
    notifier: Arc<dyn Notifier>,
    resolver: TargetResolver,
    reconciler: SubscriptionReconciler,
}

impl EventDispatcher {
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        store: Arc<dyn BillingStore>,
        catalog: PlanCatalog,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            resolver: TargetResolver::new(store.clone()),
            reconciler: SubscriptionReconciler::new(store.clone()),
            provider,
            store,
            catalog,
            notifier,
        }
    }

    /// Apply one event
    ///
    /// Errors mean the event could not be handled right now (storage or
    /// provider unavailable) and should be retried. Failures of individual
    /// writes are reported in the returned outcome instead.
    pub async fn dispatch(&self, event: &StripeEvent) -> BillingResult<EventOutcome> {
        let mut outcome = EventOutcome::new(&event.id, &event.event_type);

        match &event.payload {
            EventPayload::CheckoutSessionCompleted(session) => {
                self.on_checkout_completed(session, &mut outcome).await?
            }
            EventPayload::SubscriptionCreated(subscription)
            | EventPayload::SubscriptionUpdated(subscription) => {
                self.on_subscription_changed(subscription, &mut outcome).await?
            }
            EventPayload::SubscriptionDeleted(subscription) => {
                self.on_subscription_deleted(subscription, &mut outcome).await?
            }
            EventPayload::InvoicePaymentFailed(invoice) => {
                self.on_payment_failed(invoice, &mut outcome).await?
            }
            EventPayload::InvoicePaymentSucceeded(invoice) => {
                self.on_payment_succeeded(invoice, &mut outcome).await?
            }
            EventPayload::SubscriptionScheduleCreated(schedule) => {
                self.on_schedule_created(schedule, &mut outcome).await?
            }
            EventPayload::Unrecognized => {
                tracing::debug!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Ignoring unhandled webhook event type"
                );
            }
        }

        Ok(outcome)
    }

    /// Resolve and record the target; `None` leaves a skipped step behind
    async fn resolve(
        &self,
        hints: TargetHints<'_>,
        outcome: &mut EventOutcome,
    ) -> BillingResult<Option<Resolution>> {
        match self.resolver.resolve(hints).await? {
            Some(resolution) => {
                outcome.target = Some(resolution.target);
                outcome.push(StepOutcome::succeeded(StepKind::ResolveTarget));
                Ok(Some(resolution))
            }
            None => {
                tracing::warn!(
                    event_id = %outcome.event_id,
                    event_type = %outcome.event_type,
                    customer_id = ?hints.customer_id,
                    subscription_id = ?hints.subscription_id,
                    "Could not resolve billing target, skipping event"
                );
                outcome.push(StepOutcome::skipped(
                    StepKind::ResolveTarget,
                    "no matching account or organization",
                ));
                Ok(None)
            }
        }
    }

    async fn fetch_subscription(
        &self,
        subscription_id: &str,
        outcome: &mut EventOutcome,
    ) -> BillingResult<ProviderSubscription> {
        match self.provider.retrieve_subscription(subscription_id).await {
            Ok(subscription) => {
                outcome.push(StepOutcome::succeeded(StepKind::FetchSubscription));
                Ok(subscription)
            }
            Err(e) => {
                tracing::error!(
                    event_id = %outcome.event_id,
                    subscription_id = %subscription_id,
                    error = %e,
                    "Failed to fetch subscription from Stripe"
                );
                Err(e)
            }
        }
    }

    async fn apply(
        &self,
        resolution: &Resolution,
        desired: &DesiredState,
        outcome: &mut EventOutcome,
    ) -> BillingResult<()> {
        let result = self.reconciler.reconcile(resolution.target, desired).await?;
        outcome.extend(result.steps);
        Ok(())
    }

    async fn on_checkout_completed(
        &self,
        session: &ProviderCheckoutSession,
        outcome: &mut EventOutcome,
    ) -> BillingResult<()> {
        let hints = TargetHints {
            metadata: Some(&session.metadata),
            customer_id: session.customer_id.as_deref(),
            subscription_id: None,
            email: session.customer_email.as_deref(),
        };
        let Some(resolution) = self.resolve(hints, outcome).await? else {
            return Ok(());
        };

        let subscription = match session.subscription_id.as_deref() {
            Some(id) => Some(self.fetch_subscription(id, outcome).await?),
            None => {
                outcome.push(StepOutcome::skipped(
                    StepKind::FetchSubscription,
                    "session has no subscription",
                ));
                None
            }
        };

        let desired = desired_state_for_checkout(session, subscription.as_ref(), &self.catalog);
        self.apply(&resolution, &desired, outcome).await?;

        if let Some(raw) = session.metadata.get(META_PROMO_CODE_ID) {
            // A deferred event runs this arm again on replay; count the
            // redemption only on the run that completes
            let step = if outcome.requires_replay() {
                StepOutcome::skipped(
                    StepKind::IncrementPromoUsage,
                    "deferred until reconciliation succeeds",
                )
            } else {
                match Uuid::parse_str(raw) {
                    Ok(promo_code_id) => match self.store.increment_promo_usage(promo_code_id).await {
                        Ok(()) => StepOutcome::succeeded(StepKind::IncrementPromoUsage),
                        Err(e) => {
                            tracing::warn!(
                                promo_code_id = %promo_code_id,
                                error = %e,
                                "Failed to increment promo code usage"
                            );
                            StepOutcome::failed(StepKind::IncrementPromoUsage, e.to_string())
                        }
                    },
                    Err(_) => StepOutcome::skipped(
                        StepKind::IncrementPromoUsage,
                        format!("malformed promo code id {}", raw),
                    ),
                }
            };
            outcome.push(step);
        }

        tracing::info!(
            event_id = %outcome.event_id,
            session_id = %session.id,
            target = %resolution.target,
            status = %desired.status,
            plan = ?desired.plan,
            "Checkout completed"
        );
        Ok(())
    }

    async fn on_subscription_changed(
        &self,
        subscription: &ProviderSubscription,
        outcome: &mut EventOutcome,
    ) -> BillingResult<()> {
        let hints = TargetHints {
            metadata: Some(&subscription.metadata),
            customer_id: subscription.customer_id.as_deref(),
            subscription_id: Some(&subscription.id),
            email: None,
        };
        let Some(resolution) = self.resolve(hints, outcome).await? else {
            return Ok(());
        };

        // Deliveries can arrive out of order, so the event snapshot is not trusted
        let current = self.fetch_subscription(&subscription.id, outcome).await?;
        let desired =
            desired_state_for_subscription(&current, &self.catalog, SubscriptionStatus::Pending);
        self.apply(&resolution, &desired, outcome).await
    }

    async fn on_subscription_deleted(
        &self,
        subscription: &ProviderSubscription,
        outcome: &mut EventOutcome,
    ) -> BillingResult<()> {
        let hints = TargetHints {
            metadata: Some(&subscription.metadata),
            customer_id: subscription.customer_id.as_deref(),
            subscription_id: Some(&subscription.id),
            email: None,
        };
        let Some(resolution) = self.resolve(hints, outcome).await? else {
            return Ok(());
        };

        let cancelled_at = timestamp(subscription.canceled_at.or(subscription.ended_at))
            .unwrap_or_else(OffsetDateTime::now_utc);
        let desired = DesiredState::cancelled(cancelled_at).with_provider_ids(
            subscription.customer_id.clone(),
            Some(subscription.id.clone()),
        );
        self.apply(&resolution, &desired, outcome).await
    }

    async fn on_payment_failed(
        &self,
        invoice: &InvoiceSummary,
        outcome: &mut EventOutcome,
    ) -> BillingResult<()> {
        let hints = TargetHints {
            customer_id: invoice.customer_id.as_deref(),
            subscription_id: invoice.subscription_id.as_deref(),
            ..Default::default()
        };
        let Some(resolution) = self.resolve(hints, outcome).await? else {
            return Ok(());
        };

        let desired = DesiredState::new(SubscriptionStatus::Suspended)
            .with_provider_ids(invoice.customer_id.clone(), invoice.subscription_id.clone());
        self.apply(&resolution, &desired, outcome).await?;

        let email = resolution
            .account
            .as_ref()
            .map(|a| a.email.as_str())
            .or(invoice.customer_email.as_deref());
        let step = match email {
            Some(email) => {
                let context = NotificationContext::PaymentFailed {
                    invoice_id: invoice.id.clone(),
                    amount_due_cents: invoice.amount_due,
                    currency: invoice.currency.clone(),
                    attempt_count: invoice.attempt_count,
                    hosted_invoice_url: invoice.hosted_invoice_url.clone(),
                };
                match self.notifier.notify(email, &context).await {
                    Ok(()) => StepOutcome::succeeded(StepKind::Notify),
                    Err(e) => {
                        tracing::warn!(
                            invoice_id = %invoice.id,
                            error = %e,
                            "Failed to send payment failure notification"
                        );
                        StepOutcome::failed(StepKind::Notify, e.to_string())
                    }
                }
            }
            None => StepOutcome::skipped(StepKind::Notify, "no email address"),
        };
        outcome.push(step);

        tracing::info!(
            event_id = %outcome.event_id,
            invoice_id = %invoice.id,
            target = %resolution.target,
            "Payment failed, billing suspended"
        );
        Ok(())
    }

    async fn on_payment_succeeded(
        &self,
        invoice: &InvoiceSummary,
        outcome: &mut EventOutcome,
    ) -> BillingResult<()> {
        let Some(subscription_id) = invoice.subscription_id.as_deref() else {
            tracing::debug!(invoice_id = %invoice.id, "Invoice has no subscription, ignoring");
            return Ok(());
        };
        let hints = TargetHints {
            customer_id: invoice.customer_id.as_deref(),
            subscription_id: Some(subscription_id),
            ..Default::default()
        };
        let Some(resolution) = self.resolve(hints, outcome).await? else {
            return Ok(());
        };

        let current = self.fetch_subscription(subscription_id, outcome).await?;
        let desired =
            desired_state_for_subscription(&current, &self.catalog, SubscriptionStatus::Active);
        self.apply(&resolution, &desired, outcome).await
    }

    async fn on_schedule_created(
        &self,
        schedule: &ScheduleSummary,
        outcome: &mut EventOutcome,
    ) -> BillingResult<()> {
        let hints = TargetHints {
            metadata: Some(&schedule.metadata),
            customer_id: schedule.customer_id.as_deref(),
            subscription_id: schedule.subscription_id.as_deref(),
            email: None,
        };
        let Some(resolution) = self.resolve(hints, outcome).await? else {
            return Ok(());
        };

        let next_plan = schedule
            .next_phase_price_id
            .as_deref()
            .and_then(|price| self.catalog.plan_for_price_id(price));
        tracing::info!(
            schedule_id = %schedule.id,
            target = %resolution.target,
            next_phase_start = ?timestamp(schedule.next_phase_start),
            next_plan = ?next_plan,
            "Subscription schedule created"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{AddonPriceIds, PriceIds};
    use crate::events::parse_event;
    use crate::outcome::StepStatus;
    use crate::store::memory::InMemoryBillingStore;
    use crate::store::SubscriptionRecord;
    use crate::testing::{MockPaymentProvider, RecordingNotifier};
    use estate_shared::AccountRole;
    use serde_json::json;

    struct Fixture {
        provider: MockPaymentProvider,
        store: InMemoryBillingStore,
        notifier: RecordingNotifier,
        dispatcher: EventDispatcher,
    }

    fn catalog() -> PlanCatalog {
        PlanCatalog::new(
            PriceIds {
                basic: "price_basic".into(),
                professional: "price_pro".into(),
                enterprise: "price_ent".into(),
            },
            AddonPriceIds::default(),
        )
    }

    fn fixture() -> Fixture {
        let provider = MockPaymentProvider::new();
        let store = InMemoryBillingStore::new();
        let notifier = RecordingNotifier::new();
        let dispatcher = EventDispatcher::new(
            Arc::new(provider.clone()),
            Arc::new(store.clone()),
            catalog(),
            Arc::new(notifier.clone()),
        );
        Fixture {
            provider,
            store,
            notifier,
            dispatcher,
        }
    }

    fn subscription(id: &str, customer: &str, status: &str, price: &str) -> ProviderSubscription {
        ProviderSubscription {
            id: id.into(),
            customer_id: Some(customer.into()),
            status: Some(status.into()),
            price_id: Some(price.into()),
            current_period_end: Some(1_900_000_000),
            ..Default::default()
        }
    }

    fn record(account_id: Uuid, customer: &str, sub: &str) -> SubscriptionRecord {
        let now = OffsetDateTime::now_utc();
        SubscriptionRecord {
            id: Uuid::new_v4(),
            account_id,
            plan: SubscriptionPlan::Basic,
            status: SubscriptionStatus::Active,
            provider_customer_id: Some(customer.into()),
            provider_subscription_id: Some(sub.into()),
            current_period_end: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_checkout_without_subscription_uses_metadata_plan() {
        let session = ProviderCheckoutSession {
            id: "cs_1".into(),
            customer_id: Some("cus_1".into()),
            metadata: [(META_PLAN.to_string(), "professional".to_string())].into(),
            ..Default::default()
        };
        let desired = desired_state_for_checkout(&session, None, &catalog());
        assert_eq!(desired.status, SubscriptionStatus::Active);
        assert_eq!(desired.plan, Some(SubscriptionPlan::Professional));
        assert_eq!(desired.trial_end, TrialEnd::Clear);
    }

    #[test]
    fn test_trialing_subscription_sets_trial_end() {
        let mut sub = subscription("sub_1", "cus_1", "trialing", "price_pro");
        sub.trial_end = Some(1_800_000_000);
        let desired = desired_state_for_subscription(&sub, &catalog(), SubscriptionStatus::Pending);
        assert_eq!(desired.status, SubscriptionStatus::Trial);
        assert_eq!(desired.plan, Some(SubscriptionPlan::Professional));
        assert!(matches!(desired.trial_end, TrialEnd::Set(_)));
    }

    #[tokio::test]
    async fn test_checkout_completed_reconciles_and_counts_promo() {
        let f = fixture();
        let account = f.store.add_account("a@example.com", None, AccountRole::Owner);
        let promo_id = Uuid::new_v4();
        f.store.add_promo_code(crate::store::PromoCode {
            id: promo_id,
            code: "HELLO".into(),
            discount_type: crate::store::DiscountType::Percentage,
            discount_value: 10,
            applicable_plans: vec![],
            max_uses: None,
            used_count: 0,
            active: true,
            expires_at: None,
        });
        f.provider
            .add_subscription(subscription("sub_1", "cus_1", "active", "price_basic"));

        let event = parse_event(json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": { "object": {
                "id": "cs_1",
                "customer": "cus_1",
                "subscription": "sub_1",
                "metadata": {
                    "account_id": account.to_string(),
                    "plan": "basic",
                    "promo_code_id": promo_id.to_string()
                }
            }}
        }))
        .unwrap();

        let outcome = f.dispatcher.dispatch(&event).await.unwrap();

        assert!(!outcome.has_failures());
        let stored = f.store.account(account).unwrap();
        assert_eq!(stored.subscription_status, SubscriptionStatus::Active);
        assert_eq!(stored.subscription_plan, SubscriptionPlan::Basic);
        let records = f.store.records_for(account);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].provider_customer_id.as_deref(), Some("cus_1"));
        assert!(records[0].current_period_end.is_some());
        assert_eq!(f.store.promo_code(promo_id).unwrap().used_count, 1);
    }

    #[tokio::test]
    async fn test_subscription_update_uses_refetched_state() {
        let f = fixture();
        let account = f.store.add_account("a@example.com", None, AccountRole::Owner);
        f.store.insert_record(record(account, "cus_1", "sub_1"));
        // The event snapshot says active, the provider already moved on
        f.provider
            .add_subscription(subscription("sub_1", "cus_1", "past_due", "price_pro"));

        let event = parse_event(json!({
            "id": "evt_2",
            "type": "customer.subscription.updated",
            "data": { "object": {
                "id": "sub_1", "customer": "cus_1", "status": "active"
            }}
        }))
        .unwrap();

        f.dispatcher.dispatch(&event).await.unwrap();

        let stored = f.store.account(account).unwrap();
        assert_eq!(stored.subscription_status, SubscriptionStatus::Suspended);
        assert_eq!(stored.subscription_plan, SubscriptionPlan::Professional);
    }

    #[tokio::test]
    async fn test_subscription_deleted_resets_to_free_plan() {
        let f = fixture();
        let account = f.store.add_account("a@example.com", None, AccountRole::Owner);
        f.store.insert_record(record(account, "cus_1", "sub_1"));

        let event = parse_event(json!({
            "id": "evt_3",
            "type": "customer.subscription.deleted",
            "data": { "object": {
                "id": "sub_1", "customer": "cus_1", "status": "canceled",
                "canceled_at": 1_750_000_000
            }}
        }))
        .unwrap();

        f.dispatcher.dispatch(&event).await.unwrap();

        let stored = f.store.account(account).unwrap();
        assert_eq!(stored.subscription_status, SubscriptionStatus::Cancelled);
        assert_eq!(stored.subscription_plan, SubscriptionPlan::FreeTrial);
        assert_eq!(stored.trial_ends_at, None);
        let records = f.store.records_for(account);
        assert_eq!(records[0].status, SubscriptionStatus::Cancelled);
        assert_eq!(
            records[0].cancelled_at.map(|t| t.unix_timestamp()),
            Some(1_750_000_000)
        );
        assert_eq!(f.provider.subscription_fetches(), 0);
    }

    #[tokio::test]
    async fn test_payment_failed_suspends_and_notifies() {
        let f = fixture();
        let account = f.store.add_account("payer@example.com", None, AccountRole::Owner);
        f.store.insert_record(record(account, "cus_1", "sub_1"));

        let event = parse_event(json!({
            "id": "evt_4",
            "type": "invoice.payment_failed",
            "data": { "object": {
                "id": "in_1", "customer": "cus_1", "subscription": "sub_1",
                "amount_due": 2_900, "currency": "usd", "attempt_count": 1
            }}
        }))
        .unwrap();

        let outcome = f.dispatcher.dispatch(&event).await.unwrap();

        assert_eq!(
            f.store.account(account).unwrap().subscription_status,
            SubscriptionStatus::Suspended
        );
        let sent = f.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "payer@example.com");
        assert!(outcome
            .steps_of(StepKind::Notify)
            .all(|s| s.status == StepStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_payment_succeeded_restores_suspended_account() {
        let f = fixture();
        let account = f.store.add_account("a@example.com", None, AccountRole::Owner);
        let mut suspended = record(account, "cus_1", "sub_1");
        suspended.status = SubscriptionStatus::Suspended;
        f.store.insert_record(suspended);
        f.provider
            .add_subscription(subscription("sub_1", "cus_1", "active", "price_basic"));

        let event = parse_event(json!({
            "id": "evt_5",
            "type": "invoice.paid",
            "data": { "object": { "id": "in_2", "customer": "cus_1", "subscription": "sub_1" }}
        }))
        .unwrap();

        f.dispatcher.dispatch(&event).await.unwrap();

        assert_eq!(
            f.store.account(account).unwrap().subscription_status,
            SubscriptionStatus::Active
        );
        assert_eq!(f.store.records_for(account)[0].status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_schedule_created_does_not_mutate() {
        let f = fixture();
        let account = f.store.add_account("a@example.com", None, AccountRole::Owner);
        f.store.insert_record(record(account, "cus_1", "sub_1"));

        let event = parse_event(json!({
            "id": "evt_6",
            "type": "subscription_schedule.created",
            "created": 100,
            "data": { "object": {
                "id": "sub_sched_1", "customer": "cus_1", "subscription": "sub_1",
                "phases": [{ "start_date": 200, "items": [{ "price": "price_pro" }] }]
            }}
        }))
        .unwrap();

        let outcome = f.dispatcher.dispatch(&event).await.unwrap();
        assert!(outcome.target.is_some());
        assert_eq!(f.store.account_updates(), 0);
        assert_eq!(f.store.record_writes(), 0);
    }

    #[tokio::test]
    async fn test_provider_outage_is_an_error() {
        let f = fixture();
        let account = f.store.add_account("a@example.com", None, AccountRole::Owner);
        f.store.insert_record(record(account, "cus_1", "sub_1"));
        f.provider.fail_subscription_fetch(true);

        let event = parse_event(json!({
            "id": "evt_7",
            "type": "customer.subscription.updated",
            "data": { "object": { "id": "sub_1", "customer": "cus_1" }}
        }))
        .unwrap();

        let err = f.dispatcher.dispatch(&event).await.unwrap_err();
        assert!(err.is_transient_upstream());
        assert_eq!(f.store.account_updates(), 0);
    }

    #[tokio::test]
    async fn test_unrecognized_event_is_noop() {
        let f = fixture();
        let event = parse_event(json!({
            "id": "evt_8",
            "type": "payout.paid",
            "data": { "object": {} }
        }))
        .unwrap();
        let outcome = f.dispatcher.dispatch(&event).await.unwrap();
        assert!(outcome.steps.is_empty());
    }
}
