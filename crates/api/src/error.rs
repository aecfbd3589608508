//! API error type and HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use estate_billing::BillingError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Billing is not configured")]
    NotConfigured,

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Subscription is already cancelled")]
    AlreadyCancelled,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("Payment provider rejected the request: {0}")]
    Upstream(String),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InvalidPlan(_) | ApiError::Validation(_) | ApiError::InvalidSignature => {
                StatusCode::BAD_REQUEST
            }
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::AlreadyCancelled => StatusCode::CONFLICT,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Database(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::NotConfigured => "not_configured",
            ApiError::InvalidPlan(_) => "invalid_plan",
            ApiError::Validation(_) => "bad_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::AlreadyCancelled => "already_cancelled",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::Upstream(_) => "upstream_rejected",
            ApiError::InvalidSignature => "invalid_signature",
            ApiError::Database(_) | ApiError::Internal(_) => "internal_error",
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::NotConfigured(_) => ApiError::NotConfigured,
            BillingError::InvalidPlan(plan) => ApiError::InvalidPlan(plan),
            BillingError::InvalidInput(msg) | BillingError::WebhookPayloadInvalid(msg) => {
                ApiError::Validation(msg)
            }
            BillingError::SessionIncomplete(msg) => {
                ApiError::Validation(format!("Checkout session is not complete: {}", msg))
            }
            BillingError::NotFound(msg) => ApiError::NotFound(msg),
            BillingError::SubscriptionNotFound => {
                ApiError::NotFound("No active subscription".to_string())
            }
            BillingError::AlreadyCancelled => ApiError::AlreadyCancelled,
            BillingError::Forbidden(msg) => ApiError::Forbidden(msg),
            BillingError::StripeApi(msg) | BillingError::CouponAlreadyExists(msg) => {
                ApiError::Upstream(msg)
            }
            BillingError::WebhookSignatureInvalid => ApiError::InvalidSignature,
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::Notification(msg) | BillingError::Internal(msg) => {
                ApiError::Internal(msg)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Storage and internal details stay in the logs
        let message = match &self {
            ApiError::Database(detail) | ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "Request failed with internal error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": message,
            "code": self.code(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_errors_map_to_distinct_codes() {
        let cases = [
            (BillingError::NotConfigured("x".into()), 503, "not_configured"),
            (BillingError::InvalidPlan("gold".into()), 400, "invalid_plan"),
            (BillingError::SessionIncomplete("open".into()), 400, "bad_request"),
            (BillingError::SubscriptionNotFound, 404, "not_found"),
            (BillingError::AlreadyCancelled, 409, "already_cancelled"),
            (BillingError::Forbidden("no".into()), 403, "forbidden"),
            (BillingError::StripeApi("declined".into()), 502, "upstream_rejected"),
            (BillingError::WebhookSignatureInvalid, 400, "invalid_signature"),
            (BillingError::Database("pool".into()), 500, "internal_error"),
        ];

        for (billing, status, code) in cases {
            let api = ApiError::from(billing);
            assert_eq!(api.status().as_u16(), status, "{api:?}");
            assert_eq!(api.code(), code, "{api:?}");
        }
    }

    #[test]
    fn test_internal_detail_is_not_exposed() {
        let response = ApiError::Database("password authentication failed".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
