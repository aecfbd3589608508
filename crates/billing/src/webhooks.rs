//! Stripe webhook handling
//!
//! Verifies deliveries, runs them through the idempotency guard and the
//! dispatcher, and replays ledger rows that were left unprocessed.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use time::OffsetDateTime;

use crate::dispatcher::EventDispatcher;
use crate::error::{BillingError, BillingResult, ErrorKind};
use crate::events::{parse_event, parse_event_str, StripeEvent};
use crate::ledger::{Admission, IdempotencyGuard};
use crate::outcome::EventOutcome;
use crate::store::BillingStore;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed delivery
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// What happened to a delivered event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum WebhookDisposition {
    /// Already processed earlier, nothing ran
    Duplicate,
    /// Handled and marked processed
    Processed { outcome: EventOutcome },
    /// Acknowledged but left unprocessed so the replay job retries it
    Deferred {
        outcome: Option<EventOutcome>,
        reason: String,
    },
    /// Cannot ever be applied (unknown subscription, malformed data); marked
    /// processed so replay does not retry it
    Discarded { reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub attempted: usize,
    pub processed: usize,
    pub deferred: usize,
    pub discarded: usize,
    pub failed: usize,
}

/// Verify a `Stripe-Signature` header against the raw body
///
/// Accepts any of the `v1` signatures in the header so deliveries keep
/// verifying while a secret is being rolled.
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    now: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;
    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());

    // verify_slice compares in constant time
    let matched = signatures.iter().any(|candidate| {
        hex::decode(candidate)
            .map(|bytes| mac.clone().verify_slice(&bytes).is_ok())
            .unwrap_or(false)
    });

    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }
    Ok(())
}

/// Build a valid `Stripe-Signature` header
#[cfg(any(test, feature = "test-utils"))]
pub fn signature_header(secret: &str, timestamp: i64, payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    )
}

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    webhook_secret: String,
    store: Arc<dyn BillingStore>,
    guard: IdempotencyGuard,
    dispatcher: EventDispatcher,
}

impl WebhookHandler {
    pub fn new(
        webhook_secret: impl Into<String>,
        store: Arc<dyn BillingStore>,
        dispatcher: EventDispatcher,
    ) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            guard: IdempotencyGuard::new(store.clone()),
            store,
            dispatcher,
        }
    }

    /// Verify and parse a Stripe webhook delivery
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<StripeEvent> {
        verify_signature(
            payload,
            signature,
            &self.webhook_secret,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;
        let event = parse_event_str(payload)?;
        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Webhook signature verified"
        );
        Ok(event)
    }

    /// Verify then handle a raw delivery
    pub async fn process(
        &self,
        payload: &str,
        signature: &str,
    ) -> BillingResult<WebhookDisposition> {
        let event = self.verify_event(payload, signature)?;
        self.handle_event(&event).await
    }

    /// Handle a verified event
    ///
    /// Storage failures are returned as errors; the caller answers 5xx and the
    /// provider redelivers. Provider outages and failed state writes are
    /// acknowledged but left unprocessed for the replay job, unless the event
    /// never reached the ledger, in which case redelivery is the only retry
    /// left and the deferral becomes an error. Client errors are permanent and
    /// the event is discarded.
    pub async fn handle_event(&self, event: &StripeEvent) -> BillingResult<WebhookDisposition> {
        let journaled = match self
            .guard
            .admit(&event.id, &event.event_type, &event.raw)
            .await
        {
            Admission::AlreadyProcessed => return Ok(WebhookDisposition::Duplicate),
            Admission::Proceed { journaled } => journaled,
        };

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing Stripe webhook event"
        );

        let deferred = match self.dispatcher.dispatch(event).await {
            Ok(outcome) if outcome.requires_replay() => {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    steps = ?outcome.steps,
                    "Webhook event partially applied, leaving it for replay"
                );
                WebhookDisposition::Deferred {
                    outcome: Some(outcome),
                    reason: "reconciliation step failed".to_string(),
                }
            }
            Ok(outcome) => {
                self.guard.mark_processed(&event.id).await;
                return Ok(WebhookDisposition::Processed { outcome });
            }
            Err(e) if matches!(e.kind(), ErrorKind::Storage | ErrorKind::Internal) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook event failed"
                );
                return Err(e);
            }
            Err(e) if e.kind() == ErrorKind::Client => {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook event cannot be applied, discarding"
                );
                self.guard.mark_processed(&event.id).await;
                return Ok(WebhookDisposition::Discarded {
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook event deferred"
                );
                WebhookDisposition::Deferred {
                    outcome: None,
                    reason: e.to_string(),
                }
            }
        };

        if !journaled {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Deferred webhook event has no ledger row, requesting redelivery"
            );
            return Err(BillingError::Database(format!(
                "webhook event {} could not be journaled",
                event.id
            )));
        }
        Ok(deferred)
    }

    /// Re-run ledger rows still unprocessed after `min_age`
    ///
    /// Payloads were verified when first received, so signatures are not
    /// checked again.
    pub async fn replay_unprocessed(
        &self,
        min_age: time::Duration,
        limit: i64,
    ) -> BillingResult<ReplaySummary> {
        let cutoff = OffsetDateTime::now_utc() - min_age;
        let rows = self
            .store
            .list_unprocessed_webhook_events(cutoff, limit)
            .await?;

        let mut summary = ReplaySummary::default();
        for row in rows {
            summary.attempted += 1;

            let event = match parse_event(row.payload.clone()) {
                Ok(event) => event,
                Err(e) => {
                    tracing::error!(
                        event_id = %row.event_id,
                        error = %e,
                        "Stored webhook payload no longer parses"
                    );
                    summary.failed += 1;
                    continue;
                }
            };

            match self.handle_event(&event).await {
                Ok(WebhookDisposition::Processed { .. }) | Ok(WebhookDisposition::Duplicate) => {
                    summary.processed += 1
                }
                Ok(WebhookDisposition::Deferred { .. }) => summary.deferred += 1,
                Ok(WebhookDisposition::Discarded { .. }) => summary.discarded += 1,
                Err(e) => {
                    tracing::error!(
                        event_id = %row.event_id,
                        error = %e,
                        "Failed to replay webhook event"
                    );
                    summary.failed += 1;
                }
            }
        }

        if summary.attempted > 0 {
            tracing::info!(
                attempted = summary.attempted,
                processed = summary.processed,
                deferred = summary.deferred,
                discarded = summary.discarded,
                failed = summary.failed,
                "Replayed unprocessed webhook events"
            );
        }

        Ok(summary)
    }
}
