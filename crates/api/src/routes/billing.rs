//! Billing routes: checkout, confirmation, cancellation and the Stripe webhook

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Extension, State},
    http::HeaderMap,
    Json,
};
use estate_billing::{
    Account, AddonSelection, CancelResult, CheckoutRequest, CheckoutResponse, ConfirmResult,
    WebhookDisposition,
};
use serde::Deserialize;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutBody {
    pub plan: String,
    #[serde(default)]
    pub success_url: Option<String>,
    #[serde(default)]
    pub cancel_url: Option<String>,
    #[serde(default)]
    pub add_ons: Vec<AddonSelection>,
    #[serde(default)]
    pub promo_code: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmBody {
    pub session_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelBody {
    #[serde(default)]
    pub immediate: bool,
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| ApiError::Validation(e.body_text()))
}

/// Load the caller's account
async fn caller_account(state: &AppState, auth_user: &AuthUser) -> ApiResult<Account> {
    state
        .store
        .find_account(auth_user.account_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Account not found".to_string()))
}

/// Organization billing is limited to owners and admins
fn require_billing_role(account: &Account) -> ApiResult<()> {
    if account.organization_id.is_some() && !account.role.is_elevated() {
        tracing::warn!(
            account_id = %account.id,
            role = %account.role,
            "Billing action denied for non-elevated organization member"
        );
        return Err(ApiError::Forbidden(
            "Only organization owners and admins can manage billing".to_string(),
        ));
    }
    Ok(())
}

/// Start a hosted checkout
pub async fn create_checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    payload: Result<Json<CheckoutBody>, JsonRejection>,
) -> ApiResult<Json<CheckoutResponse>> {
    let billing = state.billing()?;
    let body = json_body(payload)?;
    let account = caller_account(&state, &auth_user).await?;
    require_billing_role(&account)?;

    let response = billing
        .checkout
        .create_checkout(
            &account,
            CheckoutRequest {
                plan: body.plan,
                add_ons: body.add_ons,
                promo_code: body.promo_code,
                success_url: body.success_url,
                cancel_url: body.cancel_url,
            },
        )
        .await?;

    Ok(Json(response))
}

/// Apply a completed checkout without waiting for the webhook
pub async fn confirm_checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    payload: Result<Json<ConfirmBody>, JsonRejection>,
) -> ApiResult<Json<ConfirmResult>> {
    let billing = state.billing()?;
    let body = json_body(payload)?;
    let account = caller_account(&state, &auth_user).await?;

    let result = billing
        .subscriptions
        .confirm_checkout(&account, body.session_id.trim())
        .await?;

    Ok(Json(result))
}

/// Cancel the caller's subscription, immediately or at period end
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    body: Bytes,
) -> ApiResult<Json<CancelResult>> {
    let billing = state.billing()?;
    // The body is optional; an empty body means cancel at period end
    let body: CancelBody = if body.iter().all(u8::is_ascii_whitespace) {
        CancelBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::Validation(e.to_string()))?
    };
    let account = caller_account(&state, &auth_user).await?;
    require_billing_role(&account)?;

    let result = billing
        .subscriptions
        .cancel_subscription(&account, body.immediate)
        .await?;

    Ok(Json(result))
}

/// Stripe webhook receiver
///
/// Answers 2xx for every verified delivery, including ones deferred for
/// replay or discarded; bad signatures, storage failures and deferrals that
/// could not be journaled are rejected so Stripe redelivers.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<WebhookDisposition>> {
    let billing = state.billing()?;
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Webhook delivery without Stripe-Signature header");
            ApiError::InvalidSignature
        })?;

    let disposition = billing.webhooks.process(&body, signature).await?;
    Ok(Json(disposition))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
        response::Response,
        Router,
    };
    use estate_billing::testing::{InMemoryBillingStore, MockPaymentProvider, RecordingNotifier};
    use estate_billing::webhooks::signature_header;
    use estate_billing::{BillingService, PlanCatalog, PriceIds, AddonPriceIds};
    use estate_shared::AccountRole;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::{config::Config, routes::create_router, state::AppState};

    const JWT_SECRET: &str = "test-jwt-secret";
    const WEBHOOK_SECRET: &str = "whsec_routes";

    struct TestApp {
        router: Router,
        state: AppState,
        store: InMemoryBillingStore,
        provider: MockPaymentProvider,
    }

    fn test_app(with_billing: bool) -> TestApp {
        let store = InMemoryBillingStore::new();
        let provider = MockPaymentProvider::new();
        let billing = with_billing.then(|| {
            Arc::new(BillingService::new(
                Arc::new(provider.clone()),
                Arc::new(store.clone()),
                Arc::new(RecordingNotifier::new()),
                PlanCatalog::new(
                    PriceIds {
                        basic: "price_basic".into(),
                        professional: "price_pro".into(),
                        enterprise: "price_ent".into(),
                    },
                    AddonPriceIds::default(),
                ),
                WEBHOOK_SECRET,
                "https://app.example.com",
                "usd",
            ))
        });
        let state =
            AppState::from_parts(Config::for_tests(JWT_SECRET), Arc::new(store.clone()), billing);

        TestApp {
            router: create_router(state.clone()),
            state,
            store,
            provider,
        }
    }

    impl TestApp {
        fn token(&self, account_id: Uuid) -> String {
            let org = self.store.account(account_id).and_then(|a| a.organization_id);
            self.state
                .jwt_manager
                .generate_access_token(account_id, org)
                .unwrap()
        }

        async fn post(&self, path: &str, token: Option<&str>, body: Value) -> Response {
            let mut request = Request::builder()
                .method("POST")
                .uri(path)
                .header("content-type", "application/json");
            if let Some(token) = token {
                request = request.header("authorization", format!("Bearer {token}"));
            }
            self.router
                .clone()
                .oneshot(request.body(Body::from(body.to_string())).unwrap())
                .await
                .unwrap()
        }
    }

    async fn json_of(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_billing_configuration() {
        for configured in [true, false] {
            let app = test_app(configured);
            let response = app
                .router
                .clone()
                .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                json_of(response).await,
                json!({ "status": "ok", "billing": configured })
            );
        }
    }

    #[tokio::test]
    async fn test_unconfigured_billing_is_service_unavailable() {
        let app = test_app(false);
        let account = app.store.add_account("a@example.com", None, AccountRole::Owner);
        let token = app.token(account);

        let response = app
            .post("/billing/checkout", Some(&token), json!({ "plan": "basic" }))
            .await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_of(response).await;
        assert_eq!(body["code"], "not_configured");
        assert_eq!(body["status"], 503);
    }

    #[tokio::test]
    async fn test_checkout_requires_token() {
        let app = test_app(true);
        let response = app
            .post("/billing/checkout", None, json!({ "plan": "basic" }))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_checkout_returns_session() {
        let app = test_app(true);
        let account = app.store.add_account("a@example.com", None, AccountRole::Member);
        let token = app.token(account);

        let response = app
            .post(
                "/billing/checkout",
                Some(&token),
                json!({
                    "plan": "BASIC",
                    "addOns": [{ "type": "unknown_addon", "quantity": 2 }],
                    "successUrl": "https://app.example.com/done"
                }),
            )
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_of(response).await;
        assert_eq!(body["id"], "cs_test_1");
        assert!(body["url"].as_str().unwrap().starts_with("https://"));
        let request = app.provider.checkout_requests().pop().unwrap();
        assert_eq!(request.success_url, "https://app.example.com/done");
    }

    #[tokio::test]
    async fn test_organization_member_cannot_start_checkout() {
        let app = test_app(true);
        let org = Uuid::new_v4();
        let member = app.store.add_account("m@example.com", Some(org), AccountRole::Member);
        let token = app.token(member);

        let response = app
            .post("/billing/checkout", Some(&token), json!({ "plan": "basic" }))
            .await;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(app.provider.checkout_requests().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_plan_and_missing_fields_are_client_errors() {
        let app = test_app(true);
        let account = app.store.add_account("a@example.com", None, AccountRole::Owner);
        let token = app.token(account);

        let response = app
            .post("/billing/checkout", Some(&token), json!({ "plan": "platinum" }))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_of(response).await["code"], "invalid_plan");

        let response = app.post("/billing/confirm", Some(&token), json!({})).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_of(response).await["code"], "bad_request");
    }

    #[tokio::test]
    async fn test_cancel_without_subscription_is_not_found() {
        let app = test_app(true);
        let account = app.store.add_account("a@example.com", None, AccountRole::Owner);
        let token = app.token(account);

        let response = app
            .post("/billing/cancel", Some(&token), json!({ "immediate": true }))
            .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(app.provider.cancelled().is_empty());
    }

    #[tokio::test]
    async fn test_webhook_signature_is_checked_before_processing() {
        let app = test_app(true);
        let payload = json!({
            "id": "evt_route",
            "type": "customer.created",
            "data": { "object": { "id": "cus_1" } }
        })
        .to_string();

        let unsigned = app
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/billing/webhook")
                    .body(Body::from(payload.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(unsigned.status(), StatusCode::BAD_REQUEST);
        assert!(app.store.webhook_event("evt_route").is_none());

        let header = signature_header(
            WEBHOOK_SECRET,
            time::OffsetDateTime::now_utc().unix_timestamp(),
            &payload,
        );
        let deliver = || {
            app.router.clone().oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/billing/webhook")
                    .header("stripe-signature", header.clone())
                    .body(Body::from(payload.clone()))
                    .unwrap(),
            )
        };

        let first = deliver().await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(json_of(first).await["disposition"], "processed");

        let second = deliver().await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(json_of(second).await["disposition"], "duplicate");
    }
}
