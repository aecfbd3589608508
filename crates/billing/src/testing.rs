//! Test doubles for the billing engine
//!
//! Compiled for unit tests and behind the `test-utils` feature so dependent
//! crates can drive billing flows without Stripe or Postgres.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::email::{NotificationContext, Notifier};
use crate::error::{BillingError, BillingResult};
use crate::provider::{
    CheckoutSessionRequest, NewCoupon, PaymentProvider, ProviderCheckoutSession,
    ProviderSubscription,
};

pub use crate::store::memory::InMemoryBillingStore;

#[derive(Default)]
struct ProviderState {
    sessions: HashMap<String, ProviderCheckoutSession>,
    subscriptions: HashMap<String, ProviderSubscription>,
    /// customer-facing code -> promotion code id
    promotion_codes: HashMap<String, String>,
    /// (id, display name)
    coupons: Vec<(String, String)>,
    checkout_requests: Vec<CheckoutSessionRequest>,
    created_coupons: Vec<NewCoupon>,
    cancelled: Vec<(String, bool)>,
    subscription_fetches: usize,
    session_counter: usize,
    fail_subscription_fetch: bool,
    fail_promotion_lookups: bool,
}

/// Scripted [`PaymentProvider`] that records every call
#[derive(Clone, Default)]
pub struct MockPaymentProvider {
    state: Arc<Mutex<ProviderState>>,
}

impl MockPaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_session(&self, session: ProviderCheckoutSession) {
        self.lock().sessions.insert(session.id.clone(), session);
    }

    pub fn add_subscription(&self, subscription: ProviderSubscription) {
        self.lock()
            .subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    /// Mark a created session complete and attach its subscription
    pub fn complete_session(&self, session_id: &str, customer_id: &str, subscription_id: &str) {
        let mut state = self.lock();
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.status = Some("complete".into());
            session.payment_status = Some("paid".into());
            session.customer_id = Some(customer_id.to_string());
            session.subscription_id = Some(subscription_id.to_string());
        }
    }

    pub fn session(&self, session_id: &str) -> Option<ProviderCheckoutSession> {
        self.lock().sessions.get(session_id).cloned()
    }

    pub fn add_promotion_code(&self, code: &str, id: &str) {
        self.lock()
            .promotion_codes
            .insert(code.to_string(), id.to_string());
    }

    pub fn add_coupon(&self, name: &str, id: &str) {
        self.lock().coupons.push((id.to_string(), name.to_string()));
    }

    pub fn checkout_requests(&self) -> Vec<CheckoutSessionRequest> {
        self.lock().checkout_requests.clone()
    }

    pub fn created_coupons(&self) -> Vec<NewCoupon> {
        self.lock().created_coupons.clone()
    }

    /// `(subscription_id, immediate)` for every cancel call
    pub fn cancelled(&self) -> Vec<(String, bool)> {
        self.lock().cancelled.clone()
    }

    pub fn subscription_fetches(&self) -> usize {
        self.lock().subscription_fetches
    }

    pub fn fail_subscription_fetch(&self, fail: bool) {
        self.lock().fail_subscription_fetch = fail;
    }

    /// Make promotion code and coupon lookups fail
    pub fn fail_promotion_lookups(&self, fail: bool) {
        self.lock().fail_promotion_lookups = fail;
    }
}

fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

#[async_trait]
impl PaymentProvider for MockPaymentProvider {
    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> BillingResult<ProviderCheckoutSession> {
        let mut state = self.lock();
        state.session_counter += 1;
        let id = format!("cs_test_{}", state.session_counter);
        let session = ProviderCheckoutSession {
            id: id.clone(),
            url: Some(format!("https://checkout.stripe.test/{}", id)),
            status: Some("open".into()),
            payment_status: Some("unpaid".into()),
            customer_id: request.customer_id.clone(),
            customer_email: request.customer_email.clone(),
            subscription_id: None,
            metadata: request.metadata.clone(),
        };
        state.sessions.insert(id, session.clone());
        state.checkout_requests.push(request);
        Ok(session)
    }

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> BillingResult<ProviderCheckoutSession> {
        self.lock()
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("checkout session {}", session_id)))
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let mut state = self.lock();
        state.subscription_fetches += 1;
        if state.fail_subscription_fetch {
            return Err(BillingError::StripeApi("stripe unavailable".into()));
        }
        state
            .subscriptions
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", subscription_id)))
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        immediate: bool,
    ) -> BillingResult<ProviderSubscription> {
        let mut state = self.lock();
        state.cancelled.push((subscription_id.to_string(), immediate));
        let subscription = state
            .subscriptions
            .entry(subscription_id.to_string())
            .or_insert_with(|| ProviderSubscription {
                id: subscription_id.to_string(),
                status: Some("active".into()),
                ..Default::default()
            });
        if immediate {
            subscription.status = Some("canceled".into());
            subscription.canceled_at = Some(unix_now());
        } else {
            subscription.cancel_at_period_end = true;
            subscription.cancel_at = subscription.current_period_end;
        }
        Ok(subscription.clone())
    }

    async fn find_active_promotion_code(&self, code: &str) -> BillingResult<Option<String>> {
        let state = self.lock();
        if state.fail_promotion_lookups {
            return Err(BillingError::StripeApi("stripe unavailable".into()));
        }
        Ok(state.promotion_codes.get(code).cloned())
    }

    async fn find_coupon(&self, code: &str) -> BillingResult<Option<String>> {
        let state = self.lock();
        if state.fail_promotion_lookups {
            return Err(BillingError::StripeApi("stripe unavailable".into()));
        }
        Ok(state
            .coupons
            .iter()
            .find(|(id, name)| id.eq_ignore_ascii_case(code) || name.eq_ignore_ascii_case(code))
            .map(|(id, _)| id.clone()))
    }

    async fn create_coupon(&self, coupon: NewCoupon) -> BillingResult<String> {
        let mut state = self.lock();
        if state.coupons.iter().any(|(id, _)| *id == coupon.id) {
            return Err(BillingError::CouponAlreadyExists(coupon.id));
        }
        state.coupons.push((coupon.id.clone(), coupon.name.clone()));
        let id = coupon.id.clone();
        state.created_coupons.push(coupon);
        Ok(id)
    }
}

/// [`Notifier`] that records deliveries instead of sending them
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<(String, NotificationContext)>>>,
    fail: Arc<Mutex<bool>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, NotificationContext)> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn fail(&self, fail: bool) {
        *self.fail.lock().unwrap_or_else(|e| e.into_inner()) = fail;
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        account_email: &str,
        context: &NotificationContext,
    ) -> BillingResult<()> {
        if *self.fail.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(BillingError::Notification("mail provider down".into()));
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((account_email.to_string(), context.clone()));
        Ok(())
    }
}
