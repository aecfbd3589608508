//! Payment provider port
//!
//! Everything the billing engine needs from Stripe, expressed in
//! provider-neutral types so services can be driven by a scripted provider in
//! tests. [`crate::client::StripeClient`] is the production implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::BillingResult;

/// Subscription as reported by the provider
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderSubscription {
    pub id: String,
    pub customer_id: Option<String>,
    /// Raw provider status string (`active`, `past_due`, ...)
    pub status: Option<String>,
    /// Price of the first line item
    pub price_id: Option<String>,
    pub metadata: HashMap<String, String>,
    /// Unix seconds
    pub current_period_end: Option<i64>,
    pub cancel_at: Option<i64>,
    pub canceled_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub cancel_at_period_end: bool,
    pub trial_end: Option<i64>,
}

/// Hosted checkout session as reported by the provider
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderCheckoutSession {
    pub id: String,
    pub url: Option<String>,
    /// `open`, `complete` or `expired`
    pub status: Option<String>,
    /// `paid`, `unpaid` or `no_payment_required`
    pub payment_status: Option<String>,
    pub customer_id: Option<String>,
    pub customer_email: Option<String>,
    pub subscription_id: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl ProviderCheckoutSession {
    /// Whether the customer finished the hosted checkout
    pub fn is_complete(&self) -> bool {
        self.status.as_deref() == Some("complete")
            || matches!(
                self.payment_status.as_deref(),
                Some("paid") | Some("no_payment_required")
            )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutLineItem {
    pub price_id: String,
    pub quantity: u64,
}

/// Discount attached to a checkout session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutDiscount {
    PromotionCode(String),
    Coupon(String),
}

/// Parameters for a subscription-mode checkout session
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutSessionRequest {
    /// Existing provider customer to attach the subscription to
    pub customer_id: Option<String>,
    /// Prefilled email when no customer exists yet
    pub customer_email: Option<String>,
    pub line_items: Vec<CheckoutLineItem>,
    pub success_url: String,
    pub cancel_url: String,
    /// Copied onto both the session and the subscription it creates
    pub metadata: HashMap<String, String>,
    pub discount: Option<CheckoutDiscount>,
    pub allow_promotion_codes: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CouponAmount {
    PercentOff(f64),
    AmountOff { cents: i64, currency: String },
}

/// One-time-use coupon created from an internal promo code
#[derive(Debug, Clone, PartialEq)]
pub struct NewCoupon {
    pub id: String,
    pub name: String,
    pub amount: CouponAmount,
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> BillingResult<ProviderCheckoutSession>;

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> BillingResult<ProviderCheckoutSession>;

    async fn retrieve_subscription(&self, subscription_id: &str)
        -> BillingResult<ProviderSubscription>;

    /// Cancel now, or flag the subscription to cancel at period end
    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        immediate: bool,
    ) -> BillingResult<ProviderSubscription>;

    /// Id of an active promotion code whose customer-facing code matches
    async fn find_active_promotion_code(&self, code: &str) -> BillingResult<Option<String>>;

    /// Id of a valid coupon whose id or display name matches
    async fn find_coupon(&self, code: &str) -> BillingResult<Option<String>>;

    /// Create a coupon and return its id
    ///
    /// Returns `BillingError::CouponAlreadyExists` when the id is taken.
    async fn create_coupon(&self, coupon: NewCoupon) -> BillingResult<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_completion_from_status_or_payment() {
        let mut session = ProviderCheckoutSession {
            status: Some("open".into()),
            payment_status: Some("unpaid".into()),
            ..Default::default()
        };
        assert!(!session.is_complete());

        session.payment_status = Some("no_payment_required".into());
        assert!(session.is_complete());

        session.payment_status = None;
        session.status = Some("complete".into());
        assert!(session.is_complete());
    }
}
