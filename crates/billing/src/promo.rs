//! Promo code resolution for checkout
//!
//! A user-supplied code is tried against, in order: an active Stripe promotion
//! code, a Stripe coupon matched by id or name, and finally an internal promo
//! code which is turned into a Stripe coupon. Coupons derived from internal
//! promos are never applied by the coupon stage, so the internal record is
//! validated on every checkout. Resolution never fails checkout; any problem
//! means no discount.

use std::collections::HashMap;
use std::sync::Arc;

use estate_shared::SubscriptionPlan;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingError;
use crate::provider::{CheckoutDiscount, CouponAmount, NewCoupon, PaymentProvider};
use crate::store::{BillingStore, DiscountType, PromoCode};

/// Discount resolved for a checkout
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppliedDiscount {
    PromotionCode { id: String },
    Coupon { id: String },
    /// Coupon derived from an internal promo code
    InternalPromo { coupon_id: String, promo_code_id: Uuid },
}

impl AppliedDiscount {
    pub fn checkout_discount(&self) -> CheckoutDiscount {
        match self {
            AppliedDiscount::PromotionCode { id } => CheckoutDiscount::PromotionCode(id.clone()),
            AppliedDiscount::Coupon { id } => CheckoutDiscount::Coupon(id.clone()),
            AppliedDiscount::InternalPromo { coupon_id, .. } => {
                CheckoutDiscount::Coupon(coupon_id.clone())
            }
        }
    }

    pub fn promo_code_id(&self) -> Option<Uuid> {
        match self {
            AppliedDiscount::InternalPromo { promo_code_id, .. } => Some(*promo_code_id),
            _ => None,
        }
    }
}

/// Stripe coupon id derived from an internal promo code
pub fn coupon_id_for(code: &str) -> String {
    let normalized: String = code
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("promo_{}", normalized)
}

pub struct PromoResolver {
    provider: Arc<dyn PaymentProvider>,
    store: Arc<dyn BillingStore>,
    currency: String,
}

impl PromoResolver {
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        store: Arc<dyn BillingStore>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            store,
            currency: currency.into(),
        }
    }

    /// Resolve a code for `plan`, `None` when no discount applies
    pub async fn resolve(&self, code: &str, plan: SubscriptionPlan) -> Option<AppliedDiscount> {
        let code = code.trim();
        if code.is_empty() {
            return None;
        }

        match self.provider.find_active_promotion_code(code).await {
            Ok(Some(id)) => {
                tracing::info!(code = %code, promotion_code_id = %id, "Applying Stripe promotion code");
                return Some(AppliedDiscount::PromotionCode { id });
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(code = %code, error = %e, "Promotion code lookup failed"),
        }

        let derived_coupon_id = coupon_id_for(code);
        match self.provider.find_coupon(code).await {
            Ok(Some(id)) if id == derived_coupon_id => {
                tracing::debug!(code = %code, coupon_id = %id, "Coupon belongs to an internal promo code");
            }
            Ok(Some(id)) => {
                tracing::info!(code = %code, coupon_id = %id, "Applying Stripe coupon");
                return Some(AppliedDiscount::Coupon { id });
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(code = %code, error = %e, "Coupon lookup failed"),
        }

        let promo = match self.store.find_promo_code(code).await {
            Ok(Some(promo)) => promo,
            Ok(None) => {
                tracing::info!(code = %code, "Promo code not found, continuing without discount");
                return None;
            }
            Err(e) => {
                tracing::warn!(code = %code, error = %e, "Promo code lookup failed");
                return None;
            }
        };

        if let Some(reason) = promo.rejection_reason(plan, OffsetDateTime::now_utc()) {
            tracing::info!(code = %code, plan = %plan, reason = reason, "Promo code rejected");
            return None;
        }

        let coupon_id = self.coupon_for_promo(&promo).await?;
        Some(AppliedDiscount::InternalPromo {
            coupon_id,
            promo_code_id: promo.id,
        })
    }

    /// Create the Stripe coupon for an internal promo, reusing an existing one
    async fn coupon_for_promo(&self, promo: &PromoCode) -> Option<String> {
        let amount = match promo.discount_type {
            DiscountType::Percentage => CouponAmount::PercentOff(promo.discount_value as f64),
            DiscountType::Fixed => CouponAmount::AmountOff {
                cents: promo.discount_value,
                currency: self.currency.clone(),
            },
        };
        let coupon = NewCoupon {
            id: coupon_id_for(&promo.code),
            name: promo.code.to_uppercase(),
            amount,
            metadata: HashMap::from([("promo_code_id".to_string(), promo.id.to_string())]),
        };
        let coupon_id = coupon.id.clone();

        match self.provider.create_coupon(coupon).await {
            Ok(id) => {
                tracing::info!(promo_code_id = %promo.id, coupon_id = %id, "Created coupon for promo code");
                Some(id)
            }
            Err(BillingError::CouponAlreadyExists(_)) => {
                tracing::debug!(coupon_id = %coupon_id, "Reusing existing coupon for promo code");
                Some(coupon_id)
            }
            Err(e) => {
                tracing::warn!(
                    promo_code_id = %promo.id,
                    error = %e,
                    "Failed to create coupon for promo code, continuing without discount"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryBillingStore;
    use crate::testing::MockPaymentProvider;

    fn promo(code: &str) -> PromoCode {
        PromoCode {
            id: Uuid::new_v4(),
            code: code.to_string(),
            discount_type: DiscountType::Percentage,
            discount_value: 25,
            applicable_plans: vec![],
            max_uses: None,
            used_count: 0,
            active: true,
            expires_at: None,
        }
    }

    fn resolver(provider: &MockPaymentProvider, store: &InMemoryBillingStore) -> PromoResolver {
        PromoResolver::new(Arc::new(provider.clone()), Arc::new(store.clone()), "usd")
    }

    #[test]
    fn test_coupon_id_is_normalized() {
        assert_eq!(coupon_id_for(" spring 25 "), "promo_SPRING_25");
        assert_eq!(coupon_id_for("vip-10"), "promo_VIP-10");
    }

    #[tokio::test]
    async fn test_provider_promotion_code_wins() {
        let provider = MockPaymentProvider::new();
        provider.add_promotion_code("SPRING", "promo_1");
        provider.add_coupon("SPRING", "coupon_1");
        let store = InMemoryBillingStore::new();
        let internal = promo("SPRING");
        store.add_promo_code(internal.clone());

        let discount = resolver(&provider, &store)
            .resolve("SPRING", SubscriptionPlan::Basic)
            .await;

        assert_eq!(discount, Some(AppliedDiscount::PromotionCode { id: "promo_1".into() }));
        assert!(provider.created_coupons().is_empty());
        assert_eq!(store.promo_code(internal.id).unwrap().used_count, 0);
    }

    #[tokio::test]
    async fn test_coupon_by_name_when_no_promotion_code() {
        let provider = MockPaymentProvider::new();
        provider.add_coupon("Launch Deal", "coupon_launch");
        let store = InMemoryBillingStore::new();

        let discount = resolver(&provider, &store)
            .resolve("launch deal", SubscriptionPlan::Basic)
            .await;

        assert_eq!(discount, Some(AppliedDiscount::Coupon { id: "coupon_launch".into() }));
    }

    #[tokio::test]
    async fn test_internal_promo_creates_coupon_once() {
        let provider = MockPaymentProvider::new();
        let store = InMemoryBillingStore::new();
        let internal = promo("welcome");
        store.add_promo_code(internal.clone());
        let resolver = resolver(&provider, &store);

        let first = resolver.resolve("WELCOME", SubscriptionPlan::Professional).await;
        let second = resolver.resolve("WELCOME", SubscriptionPlan::Professional).await;

        let expected = Some(AppliedDiscount::InternalPromo {
            coupon_id: "promo_WELCOME".into(),
            promo_code_id: internal.id,
        });
        assert_eq!(first, expected);
        assert_eq!(second, expected);
        assert_eq!(provider.created_coupons().len(), 1);
    }

    #[tokio::test]
    async fn test_existing_promo_coupon_is_revalidated() {
        let provider = MockPaymentProvider::new();
        let store = InMemoryBillingStore::new();
        let mut once = promo("ONCE");
        once.max_uses = Some(1);
        once.applicable_plans = vec![SubscriptionPlan::Basic];
        store.add_promo_code(once.clone());
        let resolver = resolver(&provider, &store);

        let first = resolver.resolve("ONCE", SubscriptionPlan::Basic).await;
        assert_eq!(first.and_then(|d| d.promo_code_id()), Some(once.id));

        once.used_count = 1;
        store.add_promo_code(once.clone());
        assert_eq!(resolver.resolve("ONCE", SubscriptionPlan::Basic).await, None);

        once.used_count = 0;
        store.add_promo_code(once);
        assert_eq!(resolver.resolve("ONCE", SubscriptionPlan::Enterprise).await, None);
        assert_eq!(provider.created_coupons().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_internal_promo_gives_no_discount() {
        let provider = MockPaymentProvider::new();
        let store = InMemoryBillingStore::new();
        let mut capped = promo("CAPPED");
        capped.max_uses = Some(1);
        capped.used_count = 1;
        store.add_promo_code(capped);

        let discount = resolver(&provider, &store)
            .resolve("CAPPED", SubscriptionPlan::Basic)
            .await;
        assert_eq!(discount, None);
    }

    #[tokio::test]
    async fn test_provider_outage_falls_through_to_internal() {
        let provider = MockPaymentProvider::new();
        provider.fail_promotion_lookups(true);
        let store = InMemoryBillingStore::new();
        let internal = promo("SUMMER");
        store.add_promo_code(internal.clone());

        let discount = resolver(&provider, &store)
            .resolve("SUMMER", SubscriptionPlan::Basic)
            .await;
        assert_eq!(discount.and_then(|d| d.promo_code_id()), Some(internal.id));
    }
}
