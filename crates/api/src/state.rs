//! Application state

use std::sync::Arc;

use estate_billing::{BillingService, BillingStore, PgBillingStore};
use sqlx::PgPool;

use crate::{
    auth::{AuthState, JwtManager},
    config::Config,
    error::ApiError,
};

const JWT_EXPIRY_HOURS: i64 = 24;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub jwt_manager: JwtManager,
    /// Account lookups for authenticated callers
    pub store: Arc<dyn BillingStore>,
    /// `None` when Stripe is not configured or billing is disabled
    pub billing: Option<Arc<BillingService>>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let billing = if config.enable_billing {
            match BillingService::from_env(pool.clone()) {
                Ok(svc) => {
                    tracing::info!("Stripe billing service initialized");
                    Some(Arc::new(svc))
                }
                Err(e) => {
                    tracing::warn!("Stripe billing not configured: {}", e);
                    None
                }
            }
        } else {
            tracing::info!("Billing disabled via config (ENABLE_BILLING=false)");
            None
        };

        Self::from_parts(config, Arc::new(PgBillingStore::new(pool)), billing)
    }

    pub fn from_parts(
        config: Config,
        store: Arc<dyn BillingStore>,
        billing: Option<Arc<BillingService>>,
    ) -> Self {
        Self {
            jwt_manager: JwtManager::new(&config.jwt_secret, JWT_EXPIRY_HOURS),
            config,
            store,
            billing,
        }
    }

    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
        }
    }

    /// Billing service, or the "not configured" error every billing entry point returns
    pub fn billing(&self) -> Result<&BillingService, ApiError> {
        self.billing.as_deref().ok_or(ApiError::NotConfigured)
    }
}
