//! API route definitions

pub mod billing;

use axum::{
    extract::State,
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{auth::require_auth, state::AppState};

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/billing/checkout", post(billing::create_checkout))
        .route("/billing/confirm", post(billing::confirm_checkout))
        .route("/billing/cancel", post(billing::cancel_subscription))
        .layer(middleware::from_fn_with_state(
            state.auth_state(),
            require_auth,
        ));

    Router::new()
        .route("/health", get(health))
        // Authenticated by signature, not by token
        .route("/billing/webhook", post(billing::stripe_webhook))
        .merge(protected)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "billing": state.billing.is_some(),
    }))
}
