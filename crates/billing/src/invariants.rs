//! Billing Invariants Module
//!
//! Runnable consistency checks for the reconciliation tables. Each check is a
//! read-only SQL query; violations carry enough context to find the affected
//! accounts. The worker runs them periodically after webhook replay.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Account(s) affected
    pub account_ids: Vec<Uuid>,
    /// Organization affected, for organization-wide checks
    pub organization_id: Option<Uuid>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Entitlements are wrong for a paying customer
    Critical,
    /// Local state disagrees with itself
    High,
    /// Replay or provider follow-up needed
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(checked_at: OffsetDateTime, violations: Vec<InvariantViolation>) -> Self {
        let checks_run = InvariantChecker::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len();
        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleRecordsRow {
    account_id: Uuid,
    record_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct StatusMismatchRow {
    account_id: Uuid,
    email: String,
    account_status: String,
    record_status: String,
    provider_subscription_id: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct StaleEventRow {
    event_id: String,
    event_type: String,
    created_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct MisalignedOrganizationRow {
    organization_id: Uuid,
    member_ids: Vec<Uuid>,
    statuses: Vec<String>,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_current_record().await?);
        violations.extend(self.check_account_matches_record().await?);
        violations.extend(self.check_stale_unprocessed_events().await?);
        violations.extend(self.check_organization_members_aligned().await?);

        Ok(InvariantCheckSummary::from_violations(now, violations))
    }

    /// Invariant 1: at most one non-cancelled record per account
    async fn check_single_current_record(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleRecordsRow> = sqlx::query_as(
            r#"
            SELECT account_id, COUNT(*) AS record_count
            FROM subscriptions
            WHERE status <> 'CANCELLED'
            GROUP BY account_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_current_record".to_string(),
                account_ids: vec![row.account_id],
                organization_id: None,
                description: format!(
                    "Account has {} non-cancelled subscription records (expected at most 1)",
                    row.record_count
                ),
                context: serde_json::json!({ "record_count": row.record_count }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 2: account status equals its latest record's status
    async fn check_account_matches_record(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StatusMismatchRow> = sqlx::query_as(
            r#"
            SELECT
                a.id AS account_id,
                a.email,
                a.subscription_status AS account_status,
                s.status AS record_status,
                s.provider_subscription_id
            FROM accounts a
            JOIN LATERAL (
                SELECT status, provider_subscription_id
                FROM subscriptions
                WHERE account_id = a.id
                ORDER BY created_at DESC
                LIMIT 1
            ) s ON TRUE
            WHERE a.subscription_status <> s.status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                // Paid access without a paying record is the expensive direction
                let severity = if row.account_status == "ACTIVE" {
                    ViolationSeverity::Critical
                } else {
                    ViolationSeverity::High
                };
                InvariantViolation {
                    invariant: "account_matches_record".to_string(),
                    account_ids: vec![row.account_id],
                    organization_id: None,
                    description: format!(
                        "Account '{}' is {} but its latest subscription record is {}",
                        row.email, row.account_status, row.record_status
                    ),
                    context: serde_json::json!({
                        "account_status": row.account_status,
                        "record_status": row.record_status,
                        "provider_subscription_id": row.provider_subscription_id,
                    }),
                    severity,
                }
            })
            .collect())
    }

    /// Invariant 3: no ledger row stays unprocessed for over an hour
    async fn check_stale_unprocessed_events(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StaleEventRow> = sqlx::query_as(
            r#"
            SELECT event_id, event_type, created_at
            FROM webhook_events
            WHERE processed = FALSE
              AND created_at < NOW() - INTERVAL '1 hour'
            ORDER BY created_at ASC
            LIMIT 100
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "stale_unprocessed_events".to_string(),
                account_ids: vec![],
                organization_id: None,
                description: format!(
                    "Webhook event {} ({}) still unprocessed since {}",
                    row.event_id, row.event_type, row.created_at
                ),
                context: serde_json::json!({
                    "event_id": row.event_id,
                    "event_type": row.event_type,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 4: members of one organization share a subscription status
    async fn check_organization_members_aligned(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MisalignedOrganizationRow> = sqlx::query_as(
            r#"
            SELECT
                organization_id,
                ARRAY_AGG(id ORDER BY id) AS member_ids,
                ARRAY_AGG(DISTINCT subscription_status) AS statuses
            FROM accounts
            WHERE organization_id IS NOT NULL
            GROUP BY organization_id
            HAVING COUNT(DISTINCT subscription_status) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "organization_members_aligned".to_string(),
                description: format!(
                    "Organization members disagree on subscription status: {}",
                    row.statuses.join(", ")
                ),
                context: serde_json::json!({ "statuses": row.statuses }),
                account_ids: row.member_ids,
                organization_id: Some(row.organization_id),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_current_record" => self.check_single_current_record().await,
            "account_matches_record" => self.check_account_matches_record().await,
            "stale_unprocessed_events" => self.check_stale_unprocessed_events().await,
            "organization_members_aligned" => self.check_organization_members_aligned().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_current_record",
            "account_matches_record",
            "stale_unprocessed_events",
            "organization_members_aligned",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::pg_test_support::{
        cleanup_test_data, create_test_account, create_test_organization, insert_test_record,
        setup_test_pool,
    };

    fn violation(invariant: &str) -> InvariantViolation {
        InvariantViolation {
            invariant: invariant.to_string(),
            account_ids: vec![Uuid::new_v4()],
            organization_id: None,
            description: String::new(),
            context: serde_json::Value::Null,
            severity: ViolationSeverity::High,
        }
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 4);
        assert!(checks.contains(&"single_current_record"));
        assert!(checks.contains(&"organization_members_aligned"));
    }

    #[test]
    fn test_summary_counts_failed_checks_once() {
        let summary = InvariantCheckSummary::from_violations(
            OffsetDateTime::now_utc(),
            vec![
                violation("single_current_record"),
                violation("single_current_record"),
                violation("stale_unprocessed_events"),
            ],
        );
        assert_eq!(summary.checks_run, 4);
        assert_eq!(summary.checks_failed, 2);
        assert_eq!(summary.checks_passed, 2);
        assert!(!summary.healthy);

        let clean = InvariantCheckSummary::from_violations(OffsetDateTime::now_utc(), vec![]);
        assert!(clean.healthy);
    }

    // Checks below scan the whole database, so assertions only look at the
    // rows each test seeded

    fn touching(violations: &[InvariantViolation], account_id: Uuid) -> Vec<&InvariantViolation> {
        violations
            .iter()
            .filter(|v| v.account_ids.contains(&account_id))
            .collect()
    }

    #[tokio::test]
    #[ignore] // Requires DATABASE_URL
    async fn test_single_current_record_flags_second_live_record() {
        let pool = setup_test_pool().await;
        let checker = InvariantChecker::new(pool.clone());
        let clean = create_test_account(&pool, None, "ACTIVE").await;
        insert_test_record(&pool, clean, "CANCELLED", &format!("sub_old_{}", clean.simple())).await;
        insert_test_record(&pool, clean, "ACTIVE", &format!("sub_new_{}", clean.simple())).await;
        let doubled = create_test_account(&pool, None, "ACTIVE").await;
        insert_test_record(&pool, doubled, "ACTIVE", &format!("sub_a_{}", doubled.simple())).await;
        insert_test_record(&pool, doubled, "PAST_DUE", &format!("sub_b_{}", doubled.simple())).await;

        let violations = checker.run_check("single_current_record").await.unwrap();

        assert!(touching(&violations, clean).is_empty());
        let flagged = touching(&violations, doubled);
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].context["record_count"], 2);

        cleanup_test_data(&pool, &[clean, doubled], None).await;
    }

    #[tokio::test]
    #[ignore] // Requires DATABASE_URL
    async fn test_account_matches_record_grades_paid_access_critical() {
        let pool = setup_test_pool().await;
        let checker = InvariantChecker::new(pool.clone());
        let aligned = create_test_account(&pool, None, "SUSPENDED").await;
        insert_test_record(&pool, aligned, "SUSPENDED", &format!("sub_{}", aligned.simple())).await;
        let unpaid = create_test_account(&pool, None, "ACTIVE").await;
        insert_test_record(&pool, unpaid, "SUSPENDED", &format!("sub_{}", unpaid.simple())).await;
        let lagging = create_test_account(&pool, None, "PENDING").await;
        insert_test_record(&pool, lagging, "ACTIVE", &format!("sub_{}", lagging.simple())).await;

        let violations = checker.run_check("account_matches_record").await.unwrap();

        assert!(touching(&violations, aligned).is_empty());
        assert_eq!(touching(&violations, unpaid)[0].severity, ViolationSeverity::Critical);
        assert_eq!(touching(&violations, lagging)[0].severity, ViolationSeverity::High);

        cleanup_test_data(&pool, &[aligned, unpaid, lagging], None).await;
    }

    #[tokio::test]
    #[ignore] // Requires DATABASE_URL
    async fn test_stale_unprocessed_events_ignores_recent_and_processed() {
        let pool = setup_test_pool().await;
        let checker = InvariantChecker::new(pool.clone());
        let suffix = Uuid::new_v4().simple().to_string();
        let stale = format!("evt_stale_{suffix}");
        let recent = format!("evt_recent_{suffix}");
        let done = format!("evt_done_{suffix}");
        let long_ago = OffsetDateTime::UNIX_EPOCH;
        for (event_id, processed, created_at) in [
            (&stale, false, long_ago),
            (&recent, false, OffsetDateTime::now_utc()),
            (&done, true, long_ago),
        ] {
            sqlx::query(
                r#"
                INSERT INTO webhook_events (event_id, event_type, processed, payload, created_at)
                VALUES ($1, 'invoice.payment_failed', $2, '{}'::jsonb, $3)
                "#,
            )
            .bind(event_id)
            .bind(processed)
            .bind(created_at)
            .execute(&pool)
            .await
            .unwrap();
        }

        let violations = checker.run_check("stale_unprocessed_events").await.unwrap();
        let flagged: Vec<&str> = violations
            .iter()
            .filter_map(|v| v.context["event_id"].as_str())
            .filter(|id| id.ends_with(&suffix))
            .collect();

        assert_eq!(flagged, vec![stale.as_str()]);

        sqlx::query("DELETE FROM webhook_events WHERE event_id = ANY($1)")
            .bind(vec![stale, recent, done])
            .execute(&pool)
            .await
            .ok();
    }

    #[tokio::test]
    #[ignore] // Requires DATABASE_URL
    async fn test_organization_members_aligned_reports_whole_organization() {
        let pool = setup_test_pool().await;
        let checker = InvariantChecker::new(pool.clone());
        let aligned_org = create_test_organization(&pool).await;
        let split_org = create_test_organization(&pool).await;
        let a1 = create_test_account(&pool, Some(aligned_org), "ACTIVE").await;
        let a2 = create_test_account(&pool, Some(aligned_org), "ACTIVE").await;
        let s1 = create_test_account(&pool, Some(split_org), "ACTIVE").await;
        let s2 = create_test_account(&pool, Some(split_org), "SUSPENDED").await;

        let violations = checker.run_check("organization_members_aligned").await.unwrap();

        assert!(violations
            .iter()
            .all(|v| v.organization_id != Some(aligned_org)));
        let split: Vec<_> = violations
            .iter()
            .filter(|v| v.organization_id == Some(split_org))
            .collect();
        assert_eq!(split.len(), 1);
        let mut members = split[0].account_ids.clone();
        members.sort();
        let mut expected = vec![s1, s2];
        expected.sort();
        assert_eq!(members, expected);

        cleanup_test_data(&pool, &[a1, a2], Some(aligned_org)).await;
        cleanup_test_data(&pool, &[s1, s2], Some(split_org)).await;
    }
}
