//! Estate Background Worker
//!
//! Handles scheduled jobs including:
//! - Replay of unprocessed Stripe webhook events (every 5 minutes)
//! - Billing invariant checks (hourly)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use estate_billing::{
    BillingService, InvariantCheckSummary, InvariantChecker, ViolationSeverity,
};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Events younger than this are still inside the provider's own retry window
const REPLAY_MIN_AGE: time::Duration = time::Duration::minutes(10);
const REPLAY_BATCH_LIMIT: i64 = 100;

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

/// Log results of an invariant run
fn log_invariant_results(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(checks_run = summary.checks_run, "Billing invariants healthy");
        return;
    }

    warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Billing invariant violations found"
    );

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                account_ids = ?violation.account_ids,
                organization_id = ?violation.organization_id,
                context = %violation.context,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                account_ids = ?violation.account_ids,
                context = %violation.context,
                "{}",
                violation.description
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Estate Worker");

    let pool = create_db_pool().await?;
    let scheduler = JobScheduler::new().await?;
    let mut job_count = 0;

    // Job 1: Replay deferred webhook events every 5 minutes
    match BillingService::from_env(pool.clone()) {
        Ok(billing) => {
            let billing = Arc::new(billing);
            scheduler
                .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
                    let billing = billing.clone();
                    Box::pin(async move {
                        match billing
                            .webhooks
                            .replay_unprocessed(REPLAY_MIN_AGE, REPLAY_BATCH_LIMIT)
                            .await
                        {
                            Ok(summary) if summary.attempted == 0 => {}
                            Ok(summary) => info!(
                                attempted = summary.attempted,
                                processed = summary.processed,
                                deferred = summary.deferred,
                                discarded = summary.discarded,
                                failed = summary.failed,
                                "Webhook replay cycle complete"
                            ),
                            Err(e) => error!(error = %e, "Webhook replay failed"),
                        }
                    })
                })?)
                .await?;
            job_count += 1;
            info!("Scheduled: Webhook event replay (every 5 minutes)");
        }
        Err(e) => {
            // Invariant checks only need the database
            warn!(error = %e, "Stripe not configured - webhook replay disabled");
        }
    }

    // Job 2: Billing invariants at the top of every hour
    let checker = Arc::new(InvariantChecker::new(pool.clone()));
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let checker = checker.clone();
            Box::pin(async move {
                match checker.run_all().await {
                    Ok(summary) => log_invariant_results(&summary),
                    Err(e) => error!(error = %e, "Billing invariant checks failed"),
                }
            })
        })?)
        .await?;
    job_count += 1;
    info!("Scheduled: Billing invariant checks (hourly)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Estate Worker started successfully with {} scheduled jobs", job_count);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
