//! Stripe Checkout sessions

use std::collections::HashMap;
use std::sync::Arc;

use estate_shared::SubscriptionPlan;
use serde::{Deserialize, Serialize};

use crate::catalog::PlanCatalog;
use crate::error::{BillingError, BillingResult};
use crate::promo::PromoResolver;
use crate::provider::{CheckoutLineItem, CheckoutSessionRequest, PaymentProvider};
use crate::store::{Account, BillingStore, RecordKey};
use crate::target::{META_ACCOUNT_ID, META_ORGANIZATION_ID, META_PLAN, META_PROMO_CODE_ID};

/// Add-on requested alongside a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddonSelection {
    #[serde(rename = "type")]
    pub addon_type: String,
    #[serde(default)]
    pub quantity: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckoutRequest {
    /// Plan name as sent by the client, matched case-insensitively
    pub plan: String,
    pub add_ons: Vec<AddonSelection>,
    pub promo_code: Option<String>,
    pub success_url: Option<String>,
    pub cancel_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutResponse {
    pub id: String,
    pub url: String,
}

/// Parse a purchasable plan name
pub fn parse_paid_plan(plan: &str) -> BillingResult<SubscriptionPlan> {
    match plan.parse::<SubscriptionPlan>() {
        Ok(plan) if plan.is_paid() => Ok(plan),
        _ => Err(BillingError::InvalidPlan(plan.to_string())),
    }
}

/// Checkout service for creating Stripe checkout sessions
pub struct CheckoutService {
    provider: Arc<dyn PaymentProvider>,
    store: Arc<dyn BillingStore>,
    catalog: PlanCatalog,
    promos: PromoResolver,
    app_base_url: String,
}

impl CheckoutService {
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        store: Arc<dyn BillingStore>,
        catalog: PlanCatalog,
        promos: PromoResolver,
        app_base_url: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            store,
            catalog,
            promos,
            app_base_url: app_base_url.into(),
        }
    }

    /// Create a hosted checkout session for a plan, add-ons and optional promo code
    ///
    /// Role checks for organization billing are the caller's responsibility.
    pub async fn create_checkout(
        &self,
        account: &Account,
        request: CheckoutRequest,
    ) -> BillingResult<CheckoutResponse> {
        let plan = parse_paid_plan(&request.plan)?;
        let price_id = self
            .catalog
            .price_id_for_plan(plan)
            .ok_or_else(|| BillingError::InvalidPlan(format!("{} (price not configured)", plan)))?;

        let mut line_items = vec![CheckoutLineItem {
            price_id: price_id.to_string(),
            quantity: 1,
        }];
        for addon in &request.add_ons {
            match self.catalog.price_id_for_addon(&addon.addon_type) {
                Some(addon_price) => line_items.push(CheckoutLineItem {
                    price_id: addon_price.to_string(),
                    quantity: u64::from(addon.quantity.unwrap_or(1).max(1)),
                }),
                None => {
                    tracing::info!(
                        account_id = %account.id,
                        addon_type = %addon.addon_type,
                        "Dropping unrecognized add-on from checkout"
                    );
                }
            }
        }

        let mut metadata = HashMap::new();
        metadata.insert(META_ACCOUNT_ID.to_string(), account.id.to_string());
        if let Some(org_id) = account.organization_id {
            metadata.insert(META_ORGANIZATION_ID.to_string(), org_id.to_string());
        }
        metadata.insert(META_PLAN.to_string(), plan.metadata_value().to_string());

        let discount = match request.promo_code.as_deref() {
            Some(code) => self.promos.resolve(code, plan).await,
            None => None,
        };
        if let Some(promo_code_id) = discount.as_ref().and_then(|d| d.promo_code_id()) {
            metadata.insert(META_PROMO_CODE_ID.to_string(), promo_code_id.to_string());
        }

        // Reuse the Stripe customer from an earlier subscription when there is one
        let customer_id = match self
            .store
            .find_account_record(account.id, RecordKey::Latest)
            .await
        {
            Ok(record) => record.and_then(|r| r.provider_customer_id),
            Err(e) => {
                tracing::warn!(
                    account_id = %account.id,
                    error = %e,
                    "Failed to look up existing customer, checkout will prefill email"
                );
                None
            }
        };

        let base_url = self.app_base_url.trim_end_matches('/');
        let success_url = request.success_url.unwrap_or_else(|| {
            format!("{}/billing/success?session_id={{CHECKOUT_SESSION_ID}}", base_url)
        });
        let cancel_url = request
            .cancel_url
            .unwrap_or_else(|| format!("{}/billing/cancel", base_url));

        let session_request = CheckoutSessionRequest {
            customer_email: customer_id.is_none().then(|| account.email.clone()),
            customer_id,
            line_items,
            success_url,
            cancel_url,
            metadata,
            // Stripe rejects allow_promotion_codes together with a discount
            allow_promotion_codes: discount.is_none(),
            discount: discount.as_ref().map(|d| d.checkout_discount()),
        };

        let session = self.provider.create_checkout_session(session_request).await?;
        let url = session.url.ok_or_else(|| {
            BillingError::StripeApi("Checkout session created without a URL".to_string())
        })?;

        tracing::info!(
            account_id = %account.id,
            organization_id = ?account.organization_id,
            session_id = %session.id,
            plan = %plan,
            discount = ?discount,
            "Created checkout session"
        );

        Ok(CheckoutResponse {
            id: session.id,
            url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{AddonPriceIds, PriceIds};
    use crate::provider::CheckoutDiscount;
    use crate::store::memory::InMemoryBillingStore;
    use crate::testing::MockPaymentProvider;
    use estate_shared::AccountRole;
    use uuid::Uuid;

    fn catalog() -> PlanCatalog {
        PlanCatalog::new(
            PriceIds {
                basic: "price_basic".into(),
                professional: "price_pro".into(),
                enterprise: String::new(),
            },
            AddonPriceIds {
                extra_properties: Some("price_props".into()),
                ..Default::default()
            },
        )
    }

    fn service(provider: &MockPaymentProvider, store: &InMemoryBillingStore) -> CheckoutService {
        let provider: Arc<dyn PaymentProvider> = Arc::new(provider.clone());
        let store: Arc<dyn BillingStore> = Arc::new(store.clone());
        CheckoutService::new(
            provider.clone(),
            store.clone(),
            catalog(),
            PromoResolver::new(provider, store, "usd"),
            "https://app.example.com/",
        )
    }

    #[tokio::test]
    async fn test_checkout_builds_line_items_and_metadata() {
        let provider = MockPaymentProvider::new();
        let store = InMemoryBillingStore::new();
        let org = Uuid::new_v4();
        let account_id = store.add_account("owner@example.com", Some(org), AccountRole::Owner);
        let account = store.account(account_id).unwrap();

        let response = service(&provider, &store)
            .create_checkout(
                &account,
                CheckoutRequest {
                    plan: "basic".into(),
                    add_ons: vec![
                        AddonSelection {
                            addon_type: "extra_properties".into(),
                            quantity: Some(0),
                        },
                        AddonSelection {
                            addon_type: "hot_tub".into(),
                            quantity: Some(3),
                        },
                    ],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(response.url.starts_with("https://"));
        let request = provider.checkout_requests().pop().unwrap();
        assert_eq!(
            request.line_items,
            vec![
                CheckoutLineItem { price_id: "price_basic".into(), quantity: 1 },
                CheckoutLineItem { price_id: "price_props".into(), quantity: 1 },
            ]
        );
        assert_eq!(request.metadata.get(META_ACCOUNT_ID), Some(&account_id.to_string()));
        assert_eq!(request.metadata.get(META_ORGANIZATION_ID), Some(&org.to_string()));
        assert_eq!(request.metadata.get(META_PLAN).map(String::as_str), Some("basic"));
        assert_eq!(request.customer_email.as_deref(), Some("owner@example.com"));
        assert!(request.allow_promotion_codes);
        assert_eq!(
            request.success_url,
            "https://app.example.com/billing/success?session_id={CHECKOUT_SESSION_ID}"
        );
    }

    #[tokio::test]
    async fn test_unknown_or_unpriced_plan_is_rejected() {
        let provider = MockPaymentProvider::new();
        let store = InMemoryBillingStore::new();
        let id = store.add_account("a@example.com", None, AccountRole::Owner);
        let account = store.account(id).unwrap();
        let service = service(&provider, &store);

        for plan in ["platinum", "free_trial", "enterprise"] {
            let err = service
                .create_checkout(
                    &account,
                    CheckoutRequest {
                        plan: plan.into(),
                        ..Default::default()
                    },
                )
                .await
                .unwrap_err();
            assert!(matches!(err, BillingError::InvalidPlan(_)), "{plan}");
        }
        assert!(provider.checkout_requests().is_empty());
    }

    #[tokio::test]
    async fn test_internal_promo_is_recorded_in_metadata() {
        let provider = MockPaymentProvider::new();
        let store = InMemoryBillingStore::new();
        let id = store.add_account("a@example.com", None, AccountRole::Owner);
        let account = store.account(id).unwrap();
        let promo_id = Uuid::new_v4();
        store.add_promo_code(crate::store::PromoCode {
            id: promo_id,
            code: "HELLO".into(),
            discount_type: crate::store::DiscountType::Fixed,
            discount_value: 1_000,
            applicable_plans: vec![SubscriptionPlan::Basic],
            max_uses: Some(5),
            used_count: 0,
            active: true,
            expires_at: None,
        });

        service(&provider, &store)
            .create_checkout(
                &account,
                CheckoutRequest {
                    plan: "BASIC".into(),
                    promo_code: Some("hello".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let request = provider.checkout_requests().pop().unwrap();
        assert_eq!(request.discount, Some(CheckoutDiscount::Coupon("promo_HELLO".into())));
        assert!(!request.allow_promotion_codes);
        assert_eq!(request.metadata.get(META_PROMO_CODE_ID), Some(&promo_id.to_string()));
        // Usage is only counted once the webhook confirms the checkout
        assert_eq!(store.promo_code(promo_id).unwrap().used_count, 0);
    }

    #[tokio::test]
    async fn test_unknown_promo_does_not_block_checkout() {
        let provider = MockPaymentProvider::new();
        let store = InMemoryBillingStore::new();
        let id = store.add_account("a@example.com", None, AccountRole::Owner);
        let account = store.account(id).unwrap();

        let result = service(&provider, &store)
            .create_checkout(
                &account,
                CheckoutRequest {
                    plan: "professional".into(),
                    promo_code: Some("NOPE".into()),
                    ..Default::default()
                },
            )
            .await;

        assert!(result.is_ok());
        let request = provider.checkout_requests().pop().unwrap();
        assert_eq!(request.discount, None);
    }
}
