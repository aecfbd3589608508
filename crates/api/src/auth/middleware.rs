//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::header::{AUTHORIZATION, COOKIE},
    middleware::Next,
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use super::jwt::JwtManager;
use crate::error::ApiError;

const AUTH_COOKIE: &str = "estate_auth_token";

/// Authenticated caller extracted from the access token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub account_id: Uuid,
    pub org_id: Option<Uuid>,
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
}

fn extract_token_from_cookie(request: &Request) -> Option<String> {
    request
        .headers()
        .get(COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookies| {
            cookies
                .split(';')
                .find_map(|c| c.trim().strip_prefix(AUTH_COOKIE)?.strip_prefix('='))
                .map(String::from)
        })
}

/// Extract bearer token from Authorization header or HttpOnly cookie
fn extract_bearer_token(request: &Request) -> Option<String> {
    if let Some(header) = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }

    extract_token_from_cookie(request)
}

/// Middleware that requires authentication
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some(token) = extract_bearer_token(&request) else {
        tracing::debug!(path = %path, "require_auth: no token in header or cookie");
        return ApiError::Unauthorized("Authentication required".into()).into_response();
    };

    match auth_state.jwt_manager.validate_access_token(&token) {
        Ok(claims) => {
            let auth_user = AuthUser {
                account_id: claims.sub,
                org_id: claims.org_id,
            };
            tracing::debug!(
                path = %path,
                account_id = %auth_user.account_id,
                org_id = ?auth_user.org_id,
                "require_auth: authentication successful"
            );
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(e) => {
            tracing::warn!(path = %path, error = %e, "require_auth: invalid token");
            ApiError::Unauthorized("Invalid or expired token".into()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::StatusCode, middleware, routing::get, Extension, Router};
    use tower::ServiceExt;

    fn app(manager: JwtManager) -> Router {
        Router::new()
            .route(
                "/me",
                get(|Extension(user): Extension<AuthUser>| async move {
                    user.account_id.to_string()
                }),
            )
            .layer(middleware::from_fn_with_state(
                AuthState {
                    jwt_manager: manager,
                },
                require_auth,
            ))
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_bearer_and_cookie_tokens_are_accepted() {
        let manager = JwtManager::new("secret", 1);
        let account = Uuid::new_v4();
        let token = manager.generate_access_token(account, None).unwrap();

        for (name, value) in [
            ("authorization", format!("Bearer {token}")),
            ("cookie", format!("theme=dark; {AUTH_COOKIE}={token}")),
        ] {
            let response = app(manager.clone())
                .oneshot(
                    Request::builder()
                        .uri("/me")
                        .header(name, value)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body_text(response).await, account.to_string());
        }
    }

    #[tokio::test]
    async fn test_missing_or_bad_token_is_unauthorized() {
        let manager = JwtManager::new("secret", 1);

        let missing = app(manager.clone())
            .oneshot(Request::builder().uri("/me").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let bad = app(manager)
            .oneshot(
                Request::builder()
                    .uri("/me")
                    .header("authorization", "Bearer not-a-jwt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::UNAUTHORIZED);
        assert!(body_text(bad).await.contains("\"code\":\"unauthorized\""));
    }
}
