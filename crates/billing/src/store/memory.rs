//! In-memory billing store for tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use estate_shared::{AccountRole, SubscriptionPlan, SubscriptionStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    Account, AccountBillingUpdate, BillingStore, PromoCode, RecordKey, SubscriptionRecord,
    SubscriptionRecordWrite, TrialEnd, WebhookEventRecord,
};
use crate::error::{BillingError, BillingResult};

/// In-memory billing store
///
/// Wraps data in Arc for cheap cloning. Counts writes so tests can assert that
/// a short-circuited path performed none, and can inject storage failures per
/// entity.
#[derive(Default, Clone)]
pub struct InMemoryBillingStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    accounts: Mutex<HashMap<Uuid, Account>>,
    records: Mutex<Vec<SubscriptionRecord>>,
    events: Mutex<HashMap<String, WebhookEventRecord>>,
    promo_codes: Mutex<HashMap<Uuid, PromoCode>>,
    account_updates: AtomicUsize,
    record_writes: AtomicUsize,
    fail_account_updates: AtomicBool,
    fail_record_writes: AtomicBool,
    fail_ledger: AtomicBool,
    fail_lookups: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn injected(what: &str) -> BillingError {
    BillingError::Database(format!("injected {} failure", what))
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an account with TRIAL/FREE_TRIAL billing state
    pub fn add_account(&self, email: &str, organization_id: Option<Uuid>, role: AccountRole) -> Uuid {
        let id = Uuid::new_v4();
        lock(&self.inner.accounts).insert(
            id,
            Account {
                id,
                email: email.to_string(),
                organization_id,
                role,
                subscription_status: SubscriptionStatus::Trial,
                subscription_plan: SubscriptionPlan::FreeTrial,
                trial_ends_at: Some(OffsetDateTime::now_utc() + time::Duration::days(14)),
            },
        );
        id
    }

    pub fn account(&self, id: Uuid) -> Option<Account> {
        lock(&self.inner.accounts).get(&id).cloned()
    }

    /// Seed a subscription record directly
    pub fn insert_record(&self, record: SubscriptionRecord) {
        lock(&self.inner.records).push(record);
    }

    pub fn records_for(&self, account_id: Uuid) -> Vec<SubscriptionRecord> {
        lock(&self.inner.records)
            .iter()
            .filter(|r| r.account_id == account_id)
            .cloned()
            .collect()
    }

    pub fn all_records(&self) -> Vec<SubscriptionRecord> {
        lock(&self.inner.records).clone()
    }

    pub fn webhook_event(&self, event_id: &str) -> Option<WebhookEventRecord> {
        lock(&self.inner.events).get(event_id).cloned()
    }

    /// Backdate a ledger row so it qualifies for replay
    pub fn age_webhook_event(&self, event_id: &str, by: time::Duration) {
        if let Some(row) = lock(&self.inner.events).get_mut(event_id) {
            row.created_at -= by;
        }
    }

    pub fn add_promo_code(&self, promo: PromoCode) {
        lock(&self.inner.promo_codes).insert(promo.id, promo);
    }

    pub fn promo_code(&self, id: Uuid) -> Option<PromoCode> {
        lock(&self.inner.promo_codes).get(&id).cloned()
    }

    pub fn account_updates(&self) -> usize {
        self.inner.account_updates.load(Ordering::SeqCst)
    }

    pub fn record_writes(&self) -> usize {
        self.inner.record_writes.load(Ordering::SeqCst)
    }

    pub fn fail_account_updates(&self, fail: bool) {
        self.inner.fail_account_updates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_record_writes(&self, fail: bool) {
        self.inner.fail_record_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_ledger(&self, fail: bool) {
        self.inner.fail_ledger.store(fail, Ordering::SeqCst);
    }

    /// Make account and record lookups fail
    pub fn fail_lookups(&self, fail: bool) {
        self.inner.fail_lookups.store(fail, Ordering::SeqCst);
    }

    fn check(&self, flag: &AtomicBool, what: &str) -> BillingResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(injected(what));
        }
        Ok(())
    }

    fn apply_write(record: &mut SubscriptionRecord, write: &SubscriptionRecordWrite) {
        if let Some(plan) = write.plan {
            record.plan = plan;
        }
        if let Some(status) = write.status {
            record.status = status;
        }
        if let Some(id) = &write.provider_customer_id {
            record.provider_customer_id = Some(id.clone());
        }
        if let Some(id) = &write.provider_subscription_id {
            record.provider_subscription_id = Some(id.clone());
        }
        if let Some(at) = write.current_period_end {
            record.current_period_end = Some(at);
        }
        record.cancelled_at = if record.status == SubscriptionStatus::Cancelled {
            write.cancelled_at.or(record.cancelled_at)
        } else {
            None
        };
        record.updated_at = OffsetDateTime::now_utc();
    }

    fn latest<'a>(
        records: impl Iterator<Item = &'a SubscriptionRecord>,
    ) -> Option<&'a SubscriptionRecord> {
        records.max_by_key(|r| r.created_at)
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn find_account(&self, account_id: Uuid) -> BillingResult<Option<Account>> {
        self.check(&self.inner.fail_lookups, "lookup")?;
        Ok(self.account(account_id))
    }

    async fn find_account_by_email(&self, email: &str) -> BillingResult<Option<Account>> {
        self.check(&self.inner.fail_lookups, "lookup")?;
        let email = email.trim();
        Ok(lock(&self.inner.accounts)
            .values()
            .find(|a| a.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn organization_member_ids(&self, organization_id: Uuid) -> BillingResult<Vec<Uuid>> {
        self.check(&self.inner.fail_lookups, "lookup")?;
        let mut ids: Vec<Uuid> = lock(&self.inner.accounts)
            .values()
            .filter(|a| a.organization_id == Some(organization_id))
            .map(|a| a.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn update_account_billing(
        &self,
        account_id: Uuid,
        update: &AccountBillingUpdate,
    ) -> BillingResult<bool> {
        self.check(&self.inner.fail_account_updates, "account update")?;
        let mut accounts = lock(&self.inner.accounts);
        let Some(account) = accounts.get_mut(&account_id) else {
            return Ok(false);
        };
        self.inner.account_updates.fetch_add(1, Ordering::SeqCst);
        account.subscription_status = update.status;
        if let Some(plan) = update.plan {
            account.subscription_plan = plan;
        }
        match update.trial_end {
            TrialEnd::Unchanged => {}
            TrialEnd::Clear => account.trial_ends_at = None,
            TrialEnd::Set(at) => account.trial_ends_at = Some(at),
        }
        Ok(true)
    }

    async fn find_account_record(
        &self,
        account_id: Uuid,
        key: RecordKey<'_>,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.check(&self.inner.fail_lookups, "lookup")?;
        let records = lock(&self.inner.records);
        let for_account = records.iter().filter(|r| r.account_id == account_id);
        let found = match key {
            RecordKey::SubscriptionId(id) => Self::latest(
                for_account.filter(|r| r.provider_subscription_id.as_deref() == Some(id)),
            ),
            RecordKey::CustomerId(id) => Self::latest(
                for_account.filter(|r| r.provider_customer_id.as_deref() == Some(id)),
            ),
            RecordKey::Latest => Self::latest(for_account),
        };
        Ok(found.cloned())
    }

    async fn find_record_by_customer_id(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.check(&self.inner.fail_lookups, "lookup")?;
        let records = lock(&self.inner.records);
        Ok(Self::latest(
            records
                .iter()
                .filter(|r| r.provider_customer_id.as_deref() == Some(customer_id)),
        )
        .cloned())
    }

    async fn find_record_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.check(&self.inner.fail_lookups, "lookup")?;
        let records = lock(&self.inner.records);
        Ok(Self::latest(
            records
                .iter()
                .filter(|r| r.provider_subscription_id.as_deref() == Some(subscription_id)),
        )
        .cloned())
    }

    async fn update_subscription_record(
        &self,
        record_id: Uuid,
        write: &SubscriptionRecordWrite,
    ) -> BillingResult<SubscriptionRecord> {
        self.check(&self.inner.fail_record_writes, "record write")?;
        let mut records = lock(&self.inner.records);
        let record = records
            .iter_mut()
            .find(|r| r.id == record_id)
            .ok_or_else(|| BillingError::NotFound(format!("subscription record {}", record_id)))?;
        Self::apply_write(record, write);
        self.inner.record_writes.fetch_add(1, Ordering::SeqCst);
        Ok(record.clone())
    }

    async fn create_subscription_record(
        &self,
        account_id: Uuid,
        write: &SubscriptionRecordWrite,
    ) -> BillingResult<SubscriptionRecord> {
        self.check(&self.inner.fail_record_writes, "record write")?;
        let account = self.account(account_id);
        let mut records = lock(&self.inner.records);
        self.inner.record_writes.fetch_add(1, Ordering::SeqCst);

        let matches_either = |r: &SubscriptionRecord| {
            r.account_id == account_id
                && ((write.provider_subscription_id.is_some()
                    && r.provider_subscription_id == write.provider_subscription_id)
                    || (write.provider_customer_id.is_some()
                        && r.provider_customer_id == write.provider_customer_id))
        };
        let existing = records
            .iter_mut()
            .filter(|r| matches_either(r))
            .max_by_key(|r| r.created_at);
        if let Some(record) = existing {
            Self::apply_write(record, write);
            return Ok(record.clone());
        }

        let now = OffsetDateTime::now_utc();
        let status = write
            .status
            .or(account.as_ref().map(|a| a.subscription_status))
            .unwrap_or(SubscriptionStatus::Pending);
        let record = SubscriptionRecord {
            id: Uuid::new_v4(),
            account_id,
            plan: write
                .plan
                .or(account.as_ref().map(|a| a.subscription_plan))
                .unwrap_or(SubscriptionPlan::FreeTrial),
            status,
            provider_customer_id: write.provider_customer_id.clone(),
            provider_subscription_id: write.provider_subscription_id.clone(),
            current_period_end: write.current_period_end,
            cancelled_at: match write.status {
                Some(SubscriptionStatus::Cancelled) => write.cancelled_at,
                _ => None,
            },
            created_at: now,
            updated_at: now,
        };
        records.push(record.clone());
        Ok(record)
    }

    async fn find_webhook_event(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        self.check(&self.inner.fail_ledger, "ledger")?;
        Ok(self.webhook_event(event_id))
    }

    async fn record_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<()> {
        self.check(&self.inner.fail_ledger, "ledger")?;
        let mut events = lock(&self.inner.events);
        match events.get_mut(event_id) {
            Some(row) if row.processed => {}
            Some(row) => {
                row.event_type = event_type.to_string();
                row.payload = payload.clone();
            }
            None => {
                events.insert(
                    event_id.to_string(),
                    WebhookEventRecord {
                        event_id: event_id.to_string(),
                        event_type: event_type.to_string(),
                        processed: false,
                        processed_at: None,
                        payload: payload.clone(),
                        created_at: OffsetDateTime::now_utc(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn mark_webhook_event_processed(&self, event_id: &str) -> BillingResult<()> {
        self.check(&self.inner.fail_ledger, "ledger")?;
        if let Some(row) = lock(&self.inner.events).get_mut(event_id) {
            row.processed = true;
            row.processed_at = Some(OffsetDateTime::now_utc());
        }
        Ok(())
    }

    async fn list_unprocessed_webhook_events(
        &self,
        created_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        self.check(&self.inner.fail_ledger, "ledger")?;
        let mut rows: Vec<WebhookEventRecord> = lock(&self.inner.events)
            .values()
            .filter(|row| !row.processed && row.created_at < created_before)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.created_at);
        rows.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(rows)
    }

    async fn find_promo_code(&self, code: &str) -> BillingResult<Option<PromoCode>> {
        let code = code.trim();
        Ok(lock(&self.inner.promo_codes)
            .values()
            .find(|p| p.code.eq_ignore_ascii_case(code))
            .cloned())
    }

    async fn increment_promo_usage(&self, promo_code_id: Uuid) -> BillingResult<()> {
        let mut promos = lock(&self.inner.promo_codes);
        let promo = promos
            .get_mut(&promo_code_id)
            .ok_or_else(|| BillingError::NotFound(format!("promo code {}", promo_code_id)))?;
        promo.used_count += 1;
        Ok(())
    }
}
