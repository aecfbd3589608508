//! Billing error types

use thiserror::Error;

/// Result alias used throughout the billing crate
pub type BillingResult<T> = Result<T, BillingError>;

/// Coarse classification of billing failures
///
/// Callers decide HTTP status, retry and logging behaviour from the kind rather
/// than matching individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Payment provider not configured
    Configuration,
    /// User-correctable request problem
    Client,
    /// Caller is not allowed to act on the target
    Authorization,
    /// Payment provider failure or signature mismatch
    Upstream,
    /// Local persistence failure
    Storage,
    Internal,
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Billing is not configured: {0}")]
    NotConfigured(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Subscription not found")]
    SubscriptionNotFound,

    #[error("Subscription is already cancelled")]
    AlreadyCancelled,

    #[error("Checkout session is not complete: {0}")]
    SessionIncomplete(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Coupon already exists: {0}")]
    CouponAlreadyExists(String),

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Invalid webhook payload: {0}")]
    WebhookPayloadInvalid(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::NotConfigured(_) => ErrorKind::Configuration,
            BillingError::InvalidPlan(_)
            | BillingError::InvalidInput(_)
            | BillingError::NotFound(_)
            | BillingError::SubscriptionNotFound
            | BillingError::AlreadyCancelled
            | BillingError::SessionIncomplete(_)
            | BillingError::WebhookPayloadInvalid(_) => ErrorKind::Client,
            BillingError::Forbidden(_) => ErrorKind::Authorization,
            BillingError::StripeApi(_)
            | BillingError::CouponAlreadyExists(_)
            | BillingError::WebhookSignatureInvalid
            | BillingError::Notification(_) => ErrorKind::Upstream,
            BillingError::Database(_) => ErrorKind::Storage,
            BillingError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Upstream failures that a later redelivery or replay may fix
    pub fn is_transient_upstream(&self) -> bool {
        matches!(self, BillingError::StripeApi(_) | BillingError::Notification(_))
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::StripeApi(e.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(e: reqwest::Error) -> Self {
        BillingError::StripeApi(format!("HTTP request failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_follow_taxonomy() {
        assert_eq!(
            BillingError::NotConfigured("STRIPE_SECRET_KEY".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(BillingError::InvalidPlan("gold".into()).kind(), ErrorKind::Client);
        assert_eq!(BillingError::Forbidden("x".into()).kind(), ErrorKind::Authorization);
        assert_eq!(BillingError::StripeApi("500".into()).kind(), ErrorKind::Upstream);
        assert_eq!(BillingError::WebhookSignatureInvalid.kind(), ErrorKind::Upstream);
        assert_eq!(BillingError::Database("down".into()).kind(), ErrorKind::Storage);
    }

    #[test]
    fn test_sqlx_errors_become_database_errors() {
        let err: BillingError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, BillingError::Database(_)));
    }
}
