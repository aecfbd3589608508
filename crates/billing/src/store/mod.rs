//! Billing persistence
//!
//! The reconciliation engine talks to storage only through [`BillingStore`].
//! [`PgBillingStore`] is the production implementation; an in-memory store is
//! available for tests behind the `test-utils` feature.

mod postgres;

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

pub use postgres::PgBillingStore;
#[cfg(test)]
pub(crate) use postgres::test_support as pg_test_support;

use async_trait::async_trait;
use estate_shared::{AccountRole, SubscriptionPlan, SubscriptionStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Billing view of an internal account
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    pub organization_id: Option<Uuid>,
    pub role: AccountRole,
    pub subscription_status: SubscriptionStatus,
    pub subscription_plan: SubscriptionPlan,
    pub trial_ends_at: Option<OffsetDateTime>,
}

/// What to do with an account's trial end timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrialEnd {
    #[default]
    Unchanged,
    Clear,
    Set(OffsetDateTime),
}

/// Field-level billing update applied to an account
#[derive(Debug, Clone, PartialEq)]
pub struct AccountBillingUpdate {
    pub status: SubscriptionStatus,
    /// `None` keeps the current plan
    pub plan: Option<SubscriptionPlan>,
    pub trial_end: TrialEnd,
}

/// Local record of one provider subscription lifecycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub account_id: Uuid,
    pub plan: SubscriptionPlan,
    pub status: SubscriptionStatus,
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: Option<String>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancelled_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Values written to a subscription record
///
/// Writes are idempotent: provider ids and the period end only ever replace a
/// stored value when present, `cancelled_at` is kept for cancelled records and
/// cleared otherwise, and a missing plan keeps the stored plan (or, on create,
/// takes the account's current plan).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionRecordWrite {
    pub plan: Option<SubscriptionPlan>,
    pub status: Option<SubscriptionStatus>,
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: Option<String>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancelled_at: Option<OffsetDateTime>,
}

impl SubscriptionRecordWrite {
    pub fn has_provider_ids(&self) -> bool {
        self.provider_customer_id.is_some() || self.provider_subscription_id.is_some()
    }
}

/// How to pick an account's current record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKey<'a> {
    SubscriptionId(&'a str),
    CustomerId(&'a str),
    /// Most recently created record
    Latest,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookEventRecord {
    pub event_id: String,
    pub event_type: String,
    pub processed: bool,
    pub processed_at: Option<OffsetDateTime>,
    pub payload: serde_json::Value,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscountType {
    /// Amount off in cents
    Fixed,
    /// Percent off, 1..=100
    Percentage,
}

impl DiscountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountType::Fixed => "FIXED",
            DiscountType::Percentage => "PERCENTAGE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "FIXED" => Some(DiscountType::Fixed),
            "PERCENTAGE" => Some(DiscountType::Percentage),
            _ => None,
        }
    }
}

/// Internally managed promo code
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromoCode {
    pub id: Uuid,
    pub code: String,
    pub discount_type: DiscountType,
    pub discount_value: i64,
    /// Empty means every paid plan
    pub applicable_plans: Vec<SubscriptionPlan>,
    pub max_uses: Option<i32>,
    pub used_count: i32,
    pub active: bool,
    pub expires_at: Option<OffsetDateTime>,
}

impl PromoCode {
    /// Why the code cannot be applied to `plan` right now, if it cannot
    pub fn rejection_reason(
        &self,
        plan: SubscriptionPlan,
        now: OffsetDateTime,
    ) -> Option<&'static str> {
        if !self.active {
            return Some("inactive");
        }
        if self.expires_at.is_some_and(|at| at <= now) {
            return Some("expired");
        }
        if self.max_uses.is_some_and(|max| self.used_count >= max) {
            return Some("usage limit reached");
        }
        if !self.applicable_plans.is_empty() && !self.applicable_plans.contains(&plan) {
            return Some("not applicable to plan");
        }
        if self.discount_value <= 0
            || (self.discount_type == DiscountType::Percentage && self.discount_value > 100)
        {
            return Some("invalid discount value");
        }
        None
    }
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    // Accounts

    async fn find_account(&self, account_id: Uuid) -> BillingResult<Option<Account>>;

    /// Case-insensitive email match
    async fn find_account_by_email(&self, email: &str) -> BillingResult<Option<Account>>;

    async fn organization_member_ids(&self, organization_id: Uuid) -> BillingResult<Vec<Uuid>>;

    /// Returns `false` when the account does not exist
    async fn update_account_billing(
        &self,
        account_id: Uuid,
        update: &AccountBillingUpdate,
    ) -> BillingResult<bool>;

    // Subscription records

    async fn find_account_record(
        &self,
        account_id: Uuid,
        key: RecordKey<'_>,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    /// Most recent record for a provider customer, across all accounts
    async fn find_record_by_customer_id(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    /// Most recent record for a provider subscription, across all accounts
    async fn find_record_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    async fn update_subscription_record(
        &self,
        record_id: Uuid,
        write: &SubscriptionRecordWrite,
    ) -> BillingResult<SubscriptionRecord>;

    /// Duplicate-safe create
    ///
    /// Re-checks for a record of the account matching either provider id and
    /// updates it instead when one exists; otherwise inserts, converging on the
    /// `(account_id, provider_subscription_id)` uniqueness constraint.
    async fn create_subscription_record(
        &self,
        account_id: Uuid,
        write: &SubscriptionRecordWrite,
    ) -> BillingResult<SubscriptionRecord>;

    // Webhook ledger

    async fn find_webhook_event(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>>;

    /// Insert an unprocessed row, or refresh type and payload of an
    /// existing unprocessed row
    async fn record_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<()>;

    async fn mark_webhook_event_processed(&self, event_id: &str) -> BillingResult<()>;

    /// Unprocessed rows created before `created_before`, oldest first
    async fn list_unprocessed_webhook_events(
        &self,
        created_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>>;

    // Promo codes

    /// Case-insensitive code match
    async fn find_promo_code(&self, code: &str) -> BillingResult<Option<PromoCode>>;

    async fn increment_promo_usage(&self, promo_code_id: Uuid) -> BillingResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn promo() -> PromoCode {
        PromoCode {
            id: Uuid::new_v4(),
            code: "SPRING".into(),
            discount_type: DiscountType::Percentage,
            discount_value: 20,
            applicable_plans: vec![SubscriptionPlan::Basic],
            max_uses: Some(10),
            used_count: 3,
            active: true,
            expires_at: None,
        }
    }

    #[test]
    fn test_promo_validation() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(promo().rejection_reason(SubscriptionPlan::Basic, now), None);
        assert_eq!(
            promo().rejection_reason(SubscriptionPlan::Enterprise, now),
            Some("not applicable to plan")
        );

        let mut p = promo();
        p.used_count = 10;
        assert_eq!(p.rejection_reason(SubscriptionPlan::Basic, now), Some("usage limit reached"));

        let mut p = promo();
        p.expires_at = Some(now - Duration::days(1));
        assert_eq!(p.rejection_reason(SubscriptionPlan::Basic, now), Some("expired"));

        let mut p = promo();
        p.active = false;
        assert_eq!(p.rejection_reason(SubscriptionPlan::Basic, now), Some("inactive"));

        let mut p = promo();
        p.applicable_plans.clear();
        p.discount_value = 150;
        assert_eq!(
            p.rejection_reason(SubscriptionPlan::Enterprise, now),
            Some("invalid discount value")
        );
    }
}
