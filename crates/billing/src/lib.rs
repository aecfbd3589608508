// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError carries provider error text
#![allow(clippy::too_many_arguments)] // Service wiring takes every collaborator explicitly
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Estate Billing Module
//!
//! Keeps each account's subscription state in step with Stripe.
//!
//! ## Features
//!
//! - **Checkout**: Hosted Stripe Checkout sessions with add-ons and promo codes
//! - **Confirmation**: Apply a completed checkout immediately, without waiting for the webhook
//! - **Cancellation**: Immediate or at period end
//! - **Webhooks**: Signature verification, idempotent processing and replay of deferred events
//! - **Reconciliation**: One state machine converging accounts and subscription records,
//!   fanned out across organization members
//! - **Invariants**: Periodic consistency checks over the billing tables

pub mod catalog;
pub mod checkout;
pub mod client;
pub mod dispatcher;
pub mod email;
pub mod error;
pub mod events;
pub mod invariants;
pub mod ledger;
pub mod outcome;
pub mod promo;
pub mod provider;
pub mod reconciler;
pub mod status;
pub mod store;
pub mod subscriptions;
pub mod target;
pub mod webhooks;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;


use std::sync::Arc;

// Catalog
pub use catalog::{AddonPriceIds, AddonType, PlanCatalog, PriceIds};

// Checkout
pub use checkout::{AddonSelection, CheckoutRequest, CheckoutResponse, CheckoutService};

// Client
pub use client::{StripeClient, StripeConfig};

// Dispatcher
pub use dispatcher::EventDispatcher;

// Email
pub use email::{BillingEmailService, EmailConfig, NotificationContext, Notifier};

// Error
pub use error::{BillingError, BillingResult, ErrorKind};

// Events
pub use events::{parse_event, parse_event_str, EventPayload, StripeEvent};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Outcomes
pub use outcome::{EventOutcome, StepKind, StepOutcome, StepStatus};

// Provider
pub use provider::PaymentProvider;

// Reconciler
pub use reconciler::{DesiredState, ReconcileOutcome, SubscriptionReconciler};

// Store
pub use store::{Account, BillingStore, PgBillingStore, SubscriptionRecord};

// Subscriptions
pub use subscriptions::{CancelResult, ConfirmResult, SubscriptionService};

// Target
pub use target::{Target, TargetResolver};

// Webhooks
pub use webhooks::{verify_signature, ReplaySummary, WebhookDisposition, WebhookHandler};

use promo::PromoResolver;
use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub checkout: CheckoutService,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
    pub catalog: PlanCatalog,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let config = stripe.config().clone();
        let email_service = BillingEmailService::from_env();

        if !email_service.is_configured() {
            tracing::warn!("Billing email not configured, payment failure notices will be skipped");
        }

        Ok(Self::new(
            Arc::new(stripe),
            Arc::new(PgBillingStore::new(pool)),
            Arc::new(email_service),
            config.catalog(),
            config.webhook_secret,
            config.app_base_url,
            config.currency,
        ))
    }

    /// Create a new billing service with explicit collaborators
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        store: Arc<dyn BillingStore>,
        notifier: Arc<dyn Notifier>,
        catalog: PlanCatalog,
        webhook_secret: impl Into<String>,
        app_base_url: impl Into<String>,
        currency: impl Into<String>,
    ) -> Self {
        let promos = PromoResolver::new(provider.clone(), store.clone(), currency);
        let dispatcher = EventDispatcher::new(
            provider.clone(),
            store.clone(),
            catalog.clone(),
            notifier,
        );

        Self {
            checkout: CheckoutService::new(
                provider.clone(),
                store.clone(),
                catalog.clone(),
                promos,
                app_base_url,
            ),
            subscriptions: SubscriptionService::new(provider, store.clone(), catalog.clone()),
            webhooks: WebhookHandler::new(webhook_secret, store, dispatcher),
            catalog,
        }
    }
}
