//! Postgres-backed billing store

use async_trait::async_trait;
use estate_shared::{SubscriptionPlan, SubscriptionStatus};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    Account, AccountBillingUpdate, BillingStore, DiscountType, PromoCode, RecordKey,
    SubscriptionRecord, SubscriptionRecordWrite, TrialEnd, WebhookEventRecord,
};
use crate::error::{BillingError, BillingResult};

const RECORD_COLUMNS: &str = "id, account_id, plan, status, provider_customer_id, \
    provider_subscription_id, current_period_end, cancelled_at, created_at, updated_at";

const ACCOUNT_COLUMNS: &str =
    "id, email, organization_id, role, subscription_status, subscription_plan, trial_ends_at";

/// Attempts for the serializable create before giving up
const SERIALIZABLE_ATTEMPTS: u32 = 3;

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: Uuid,
    email: String,
    organization_id: Option<Uuid>,
    role: String,
    subscription_status: String,
    subscription_plan: String,
    trial_ends_at: Option<OffsetDateTime>,
}

impl TryFrom<AccountRow> for Account {
    type Error = BillingError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        Ok(Account {
            id: row.id,
            email: row.email,
            organization_id: row.organization_id,
            role: row.role.parse().map_err(corrupt)?,
            subscription_status: row.subscription_status.parse().map_err(corrupt)?,
            subscription_plan: row.subscription_plan.parse().map_err(corrupt)?,
            trial_ends_at: row.trial_ends_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    id: Uuid,
    account_id: Uuid,
    plan: String,
    status: String,
    provider_customer_id: Option<String>,
    provider_subscription_id: Option<String>,
    current_period_end: Option<OffsetDateTime>,
    cancelled_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<RecordRow> for SubscriptionRecord {
    type Error = BillingError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        Ok(SubscriptionRecord {
            id: row.id,
            account_id: row.account_id,
            plan: row.plan.parse().map_err(corrupt)?,
            status: row.status.parse().map_err(corrupt)?,
            provider_customer_id: row.provider_customer_id,
            provider_subscription_id: row.provider_subscription_id,
            current_period_end: row.current_period_end,
            cancelled_at: row.cancelled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WebhookEventRow {
    event_id: String,
    event_type: String,
    processed: bool,
    processed_at: Option<OffsetDateTime>,
    payload: serde_json::Value,
    created_at: OffsetDateTime,
}

impl From<WebhookEventRow> for WebhookEventRecord {
    fn from(row: WebhookEventRow) -> Self {
        WebhookEventRecord {
            event_id: row.event_id,
            event_type: row.event_type,
            processed: row.processed,
            processed_at: row.processed_at,
            payload: row.payload,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PromoCodeRow {
    id: Uuid,
    code: String,
    discount_type: String,
    discount_value: i64,
    applicable_plans: Vec<String>,
    max_uses: Option<i32>,
    used_count: i32,
    active: bool,
    expires_at: Option<OffsetDateTime>,
}

impl TryFrom<PromoCodeRow> for PromoCode {
    type Error = BillingError;

    fn try_from(row: PromoCodeRow) -> Result<Self, Self::Error> {
        let discount_type = DiscountType::parse(&row.discount_type).ok_or_else(|| {
            BillingError::Database(format!("unknown discount type: {}", row.discount_type))
        })?;
        // Unknown plan names in the applicable set are ignored rather than
        // making the whole code unusable
        let applicable_plans = row
            .applicable_plans
            .iter()
            .filter_map(|p| p.parse::<SubscriptionPlan>().ok())
            .collect();
        Ok(PromoCode {
            id: row.id,
            code: row.code,
            discount_type,
            discount_value: row.discount_value,
            applicable_plans,
            max_uses: row.max_uses,
            used_count: row.used_count,
            active: row.active,
            expires_at: row.expires_at,
        })
    }
}

fn corrupt(e: estate_shared::ParseEnumError) -> BillingError {
    BillingError::Database(format!("corrupt row: {}", e))
}

fn is_serialization_failure(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("40001") | Some("40P01")),
        _ => false,
    }
}

/// `cancelled_at` is only written for cancelled records
fn cancelled_at_for(write: &SubscriptionRecordWrite) -> Option<OffsetDateTime> {
    match write.status {
        Some(SubscriptionStatus::Cancelled) => write.cancelled_at,
        _ => None,
    }
}

/// Postgres implementation of [`BillingStore`]
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Single attempt of the duplicate-safe create inside a serializable transaction
    async fn try_create_record(
        &self,
        account_id: Uuid,
        write: &SubscriptionRecordWrite,
    ) -> Result<RecordRow, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        // Re-check right before insert: a concurrent delivery may have created
        // the record since the caller's lookup
        let existing: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM subscriptions
            WHERE account_id = $1
              AND (
                ($2::TEXT IS NOT NULL AND provider_subscription_id = $2)
                OR ($3::TEXT IS NOT NULL AND provider_customer_id = $3)
              )
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(account_id)
        .bind(write.provider_subscription_id.as_deref())
        .bind(write.provider_customer_id.as_deref())
        .fetch_optional(&mut *tx)
        .await?;

        let row = match existing {
            Some((record_id,)) => {
                tracing::debug!(
                    account_id = %account_id,
                    record_id = %record_id,
                    "Subscription record appeared before insert, updating instead"
                );
                update_record_query(record_id, write)
                    .fetch_one(&mut *tx)
                    .await?
            }
            None => {
                sqlx::query_as::<_, RecordRow>(&format!(
                    r#"
                    INSERT INTO subscriptions (
                        id, account_id, plan, status, provider_customer_id,
                        provider_subscription_id, current_period_end, cancelled_at
                    )
                    VALUES (
                        $1, $2,
                        COALESCE($3, (SELECT subscription_plan FROM accounts WHERE id = $2), 'FREE_TRIAL'),
                        COALESCE($4, (SELECT subscription_status FROM accounts WHERE id = $2), 'PENDING'),
                        $5, $6, $7, $8
                    )
                    ON CONFLICT (account_id, provider_subscription_id) DO UPDATE SET
                        plan = EXCLUDED.plan,
                        status = EXCLUDED.status,
                        provider_customer_id = COALESCE(EXCLUDED.provider_customer_id, subscriptions.provider_customer_id),
                        current_period_end = COALESCE(EXCLUDED.current_period_end, subscriptions.current_period_end),
                        cancelled_at = CASE
                            WHEN EXCLUDED.status = 'CANCELLED'
                                THEN COALESCE(EXCLUDED.cancelled_at, subscriptions.cancelled_at)
                            ELSE NULL
                        END,
                        updated_at = NOW()
                    RETURNING {RECORD_COLUMNS}
                    "#
                ))
                .bind(Uuid::new_v4())
                .bind(account_id)
                .bind(write.plan.map(|p| p.as_str()))
                .bind(write.status.map(|s| s.as_str()))
                .bind(write.provider_customer_id.as_deref())
                .bind(write.provider_subscription_id.as_deref())
                .bind(write.current_period_end)
                .bind(cancelled_at_for(write))
                .fetch_one(&mut *tx)
                .await?
            }
        };

        tx.commit().await?;
        Ok(row)
    }
}

fn update_record_query(
    record_id: Uuid,
    write: &SubscriptionRecordWrite,
) -> sqlx::query::QueryAs<'static, sqlx::Postgres, RecordRow, sqlx::postgres::PgArguments> {
    const UPDATE_RECORD_SQL: &str = r#"
        UPDATE subscriptions SET
            plan = COALESCE($2, plan),
            status = COALESCE($3, status),
            provider_customer_id = COALESCE($4, provider_customer_id),
            provider_subscription_id = COALESCE($5, provider_subscription_id),
            current_period_end = COALESCE($6, current_period_end),
            cancelled_at = CASE
                WHEN COALESCE($3, status) = 'CANCELLED' THEN COALESCE($7, cancelled_at)
                ELSE NULL
            END,
            updated_at = NOW()
        WHERE id = $1
        RETURNING id, account_id, plan, status, provider_customer_id,
            provider_subscription_id, current_period_end, cancelled_at, created_at, updated_at
    "#;

    sqlx::query_as::<_, RecordRow>(UPDATE_RECORD_SQL)
        .bind(record_id)
        .bind(write.plan.map(|p| p.as_str()))
        .bind(write.status.map(|s| s.as_str()))
        .bind(write.provider_customer_id.clone())
        .bind(write.provider_subscription_id.clone())
        .bind(write.current_period_end)
        .bind(write.cancelled_at)
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn find_account(&self, account_id: Uuid) -> BillingResult<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Account::try_from).transpose()
    }

    async fn find_account_by_email(&self, email: &str) -> BillingResult<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE LOWER(email) = LOWER($1)"
        ))
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Account::try_from).transpose()
    }

    async fn organization_member_ids(&self, organization_id: Uuid) -> BillingResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM accounts WHERE organization_id = $1 ORDER BY created_at",
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn update_account_billing(
        &self,
        account_id: Uuid,
        update: &AccountBillingUpdate,
    ) -> BillingResult<bool> {
        let (touch_trial, trial_ends_at) = match update.trial_end {
            TrialEnd::Unchanged => (false, None),
            TrialEnd::Clear => (true, None),
            TrialEnd::Set(at) => (true, Some(at)),
        };

        let result = sqlx::query(
            r#"
            UPDATE accounts SET
                subscription_status = $2,
                subscription_plan = COALESCE($3, subscription_plan),
                trial_ends_at = CASE WHEN $4 THEN $5 ELSE trial_ends_at END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(account_id)
        .bind(update.status.as_str())
        .bind(update.plan.map(|p| p.as_str()))
        .bind(touch_trial)
        .bind(trial_ends_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_account_record(
        &self,
        account_id: Uuid,
        key: RecordKey<'_>,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let row = match key {
            RecordKey::SubscriptionId(id) => sqlx::query_as::<_, RecordRow>(&format!(
                "SELECT {RECORD_COLUMNS} FROM subscriptions \
                 WHERE account_id = $1 AND provider_subscription_id = $2 \
                 ORDER BY created_at DESC LIMIT 1"
            ))
            .bind(account_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?,
            RecordKey::CustomerId(id) => sqlx::query_as::<_, RecordRow>(&format!(
                "SELECT {RECORD_COLUMNS} FROM subscriptions \
                 WHERE account_id = $1 AND provider_customer_id = $2 \
                 ORDER BY created_at DESC LIMIT 1"
            ))
            .bind(account_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?,
            RecordKey::Latest => sqlx::query_as::<_, RecordRow>(&format!(
                "SELECT {RECORD_COLUMNS} FROM subscriptions \
                 WHERE account_id = $1 ORDER BY created_at DESC LIMIT 1"
            ))
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?,
        };
        row.map(SubscriptionRecord::try_from).transpose()
    }

    async fn find_record_by_customer_id(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let row = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM subscriptions \
             WHERE provider_customer_id = $1 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SubscriptionRecord::try_from).transpose()
    }

    async fn find_record_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let row = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM subscriptions \
             WHERE provider_subscription_id = $1 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SubscriptionRecord::try_from).transpose()
    }

    async fn update_subscription_record(
        &self,
        record_id: Uuid,
        write: &SubscriptionRecordWrite,
    ) -> BillingResult<SubscriptionRecord> {
        let row = update_record_query(record_id, write)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription record {}", record_id)))?;
        SubscriptionRecord::try_from(row)
    }

    async fn create_subscription_record(
        &self,
        account_id: Uuid,
        write: &SubscriptionRecordWrite,
    ) -> BillingResult<SubscriptionRecord> {
        let mut attempt = 1;
        loop {
            match self.try_create_record(account_id, write).await {
                Ok(row) => return SubscriptionRecord::try_from(row),
                Err(e) if is_serialization_failure(&e) && attempt < SERIALIZABLE_ATTEMPTS => {
                    tracing::debug!(
                        account_id = %account_id,
                        attempt = attempt,
                        "Serialization conflict creating subscription record, retrying"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn find_webhook_event(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        let row: Option<WebhookEventRow> = sqlx::query_as(
            r#"
            SELECT event_id, event_type, processed, processed_at, payload, created_at
            FROM webhook_events
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn record_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_events (event_id, event_type, payload)
            VALUES ($1, $2, $3)
            ON CONFLICT (event_id) DO UPDATE SET
                event_type = EXCLUDED.event_type,
                payload = EXCLUDED.payload,
                updated_at = NOW()
            WHERE webhook_events.processed = FALSE
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_webhook_event_processed(&self, event_id: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET processed = TRUE, processed_at = NOW(), updated_at = NOW()
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_unprocessed_webhook_events(
        &self,
        created_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let rows: Vec<WebhookEventRow> = sqlx::query_as(
            r#"
            SELECT event_id, event_type, processed, processed_at, payload, created_at
            FROM webhook_events
            WHERE processed = FALSE AND created_at < $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(created_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn find_promo_code(&self, code: &str) -> BillingResult<Option<PromoCode>> {
        let row: Option<PromoCodeRow> = sqlx::query_as(
            r#"
            SELECT id, code, discount_type, discount_value, applicable_plans,
                   max_uses, used_count, active, expires_at
            FROM promo_codes
            WHERE UPPER(code) = UPPER($1)
            "#,
        )
        .bind(code.trim())
        .fetch_optional(&self.pool)
        .await?;
        row.map(PromoCode::try_from).transpose()
    }

    async fn increment_promo_usage(&self, promo_code_id: Uuid) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE promo_codes SET used_count = used_count + 1, updated_at = NOW() WHERE id = $1",
        )
        .bind(promo_code_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("promo code {}", promo_code_id)));
        }
        Ok(())
    }
}
