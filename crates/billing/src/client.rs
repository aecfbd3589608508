//! Stripe client wrapper

use std::time::Duration;

use async_trait::async_trait;
use stripe::{
    CancelSubscription, CheckoutSession, CheckoutSessionMode, Client, Coupon, CouponDuration,
    CouponId, CreateCheckoutSession, CreateCheckoutSessionDiscounts,
    CreateCheckoutSessionLineItems, CreateCheckoutSessionSubscriptionData, CreateCoupon,
    CustomerId, ListCoupons, ListPromotionCodes, PromotionCode, StripeError, Subscription,
    SubscriptionId, UpdateSubscription,
};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::catalog::{AddonPriceIds, PlanCatalog, PriceIds};
use crate::error::{BillingError, BillingResult};
use crate::events::{parse_checkout_session, parse_subscription};
use crate::provider::{
    CheckoutDiscount, CheckoutSessionRequest, CouponAmount, NewCoupon, PaymentProvider,
    ProviderCheckoutSession, ProviderSubscription,
};

const STRIPE_API_BASE: &str = "https://api.stripe.com/v1";

/// Stripe configuration
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub app_base_url: String,
    pub currency: String,
    pub prices: PriceIds,
    pub addon_prices: AddonPriceIds,
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn required_env(name: &str) -> BillingResult<String> {
    optional_env(name).ok_or_else(|| BillingError::NotConfigured(format!("{} not set", name)))
}

impl StripeConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = Self {
            secret_key: required_env("STRIPE_SECRET_KEY")?,
            webhook_secret: required_env("STRIPE_WEBHOOK_SECRET")?,
            app_base_url: optional_env("APP_BASE_URL")
                .unwrap_or_else(|| "http://localhost:3000".to_string()),
            currency: optional_env("STRIPE_CURRENCY").unwrap_or_else(|| "usd".to_string()),
            prices: PriceIds {
                basic: optional_env("STRIPE_PRICE_BASIC").unwrap_or_default(),
                professional: optional_env("STRIPE_PRICE_PROFESSIONAL").unwrap_or_default(),
                enterprise: optional_env("STRIPE_PRICE_ENTERPRISE").unwrap_or_default(),
            },
            addon_prices: AddonPriceIds {
                extra_properties: optional_env("STRIPE_PRICE_ADDON_EXTRA_PROPERTIES"),
                priority_support: optional_env("STRIPE_PRICE_ADDON_PRIORITY_SUPPORT"),
                document_storage: optional_env("STRIPE_PRICE_ADDON_DOCUMENT_STORAGE"),
            },
        };

        if config.prices.basic.is_empty() && config.prices.professional.is_empty() {
            tracing::warn!("No Stripe plan prices configured, checkout will reject every plan");
        }

        Ok(config)
    }

    pub fn catalog(&self) -> PlanCatalog {
        PlanCatalog::new(self.prices.clone(), self.addon_prices.clone())
    }
}

/// Stripe API client
#[derive(Clone)]
pub struct StripeClient {
    inner: Client,
    http: reqwest::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = Client::new(&config.secret_key);
        Self {
            inner,
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    /// Underlying async-stripe client
    pub fn inner(&self) -> &Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// GET an API object as raw JSON
    ///
    /// async-stripe's generated types lag behind the API version Stripe serves
    /// (subscription periods moved onto items), so reads go through our own
    /// parsers.
    async fn get_object(&self, path: &str) -> BillingResult<serde_json::Value> {
        let url = format!("{}/{}", STRIPE_API_BASE, path);
        let result = RetryIf::spawn(
            retry_strategy(),
            || async {
                let response = self
                    .http
                    .get(&url)
                    .bearer_auth(&self.config.secret_key)
                    .send()
                    .await
                    .map_err(RawFailure::Transport)?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(RawFailure::Status(status.as_u16(), body));
                }
                response
                    .json::<serde_json::Value>()
                    .await
                    .map_err(RawFailure::Transport)
            },
            RawFailure::is_retryable,
        )
        .await;

        match result {
            Ok(value) => Ok(value),
            Err(RawFailure::Status(404, _)) => Err(BillingError::NotFound(path.to_string())),
            Err(RawFailure::Status(status, body)) => {
                tracing::error!(path = %path, status = status, body = %body, "Stripe API request failed");
                Err(BillingError::StripeApi(format!("Stripe API error ({}) for {}", status, path)))
            }
            Err(RawFailure::Transport(e)) => Err(e.into()),
        }
    }
}

enum RawFailure {
    Transport(reqwest::Error),
    Status(u16, String),
}

impl RawFailure {
    fn is_retryable(&self) -> bool {
        match self {
            RawFailure::Transport(e) => e.is_timeout() || e.is_connect(),
            RawFailure::Status(status, _) => *status == 429 || (500..600).contains(status),
        }
    }
}

fn retry_strategy() -> impl Iterator<Item = Duration> {
    // 100ms, 200ms, 400ms before jitter
    ExponentialBackoff::from_millis(2)
        .factor(50)
        .max_delay(Duration::from_secs(2))
        .map(jitter)
        .take(3)
}

/// Rate limits, server errors and timeouts are worth retrying
fn is_retryable_error(error: &StripeError) -> bool {
    match error {
        StripeError::Stripe(request_error) => {
            let status = request_error.http_status;
            status == 429 || (500..600).contains(&status)
        }
        StripeError::Timeout => true,
        _ => false,
    }
}

async fn with_retry<T, F, Fut>(operation: &str, action: F) -> BillingResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StripeError>>,
{
    RetryIf::spawn(retry_strategy(), action, is_retryable_error)
        .await
        .map_err(|e| {
            tracing::error!(operation = operation, error = %e, "Stripe API call failed");
            BillingError::from(e)
        })
}

fn is_not_found(error: &StripeError) -> bool {
    matches!(error, StripeError::Stripe(request_error) if request_error.http_status == 404)
}

fn subscription_from_stripe(subscription: &Subscription) -> BillingResult<ProviderSubscription> {
    let value = serde_json::to_value(subscription)
        .map_err(|e| BillingError::Internal(format!("Failed to encode subscription: {}", e)))?;
    parse_subscription(value)
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> BillingResult<ProviderCheckoutSession> {
        let mut params = CreateCheckoutSession::new();
        params.mode = Some(CheckoutSessionMode::Subscription);
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);

        if let Some(customer_id) = request.customer_id.as_deref() {
            let customer_id = customer_id.parse::<CustomerId>().map_err(|_| {
                BillingError::InvalidInput(format!("Invalid customer ID: {}", customer_id))
            })?;
            params.customer = Some(customer_id);
        } else if let Some(email) = request.customer_email.as_deref() {
            params.customer_email = Some(email);
        }

        params.line_items = Some(
            request
                .line_items
                .iter()
                .map(|item| CreateCheckoutSessionLineItems {
                    price: Some(item.price_id.clone()),
                    quantity: Some(item.quantity),
                    ..Default::default()
                })
                .collect(),
        );

        params.metadata = Some(request.metadata.clone());
        params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
            metadata: Some(request.metadata.clone()),
            ..Default::default()
        });

        match &request.discount {
            Some(CheckoutDiscount::PromotionCode(id)) => {
                params.discounts = Some(vec![CreateCheckoutSessionDiscounts {
                    promotion_code: Some(id.clone()),
                    ..Default::default()
                }]);
            }
            Some(CheckoutDiscount::Coupon(id)) => {
                params.discounts = Some(vec![CreateCheckoutSessionDiscounts {
                    coupon: Some(id.clone()),
                    ..Default::default()
                }]);
            }
            None => {
                params.allow_promotion_codes = Some(request.allow_promotion_codes);
            }
        }

        // Creation is not retried, a retry could open a second session
        let session = CheckoutSession::create(&self.inner, params).await?;

        Ok(ProviderCheckoutSession {
            id: session.id.to_string(),
            url: session.url.clone(),
            status: Some("open".to_string()),
            customer_id: request.customer_id,
            customer_email: request.customer_email,
            metadata: request.metadata,
            ..Default::default()
        })
    }

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> BillingResult<ProviderCheckoutSession> {
        let value = self
            .get_object(&format!("checkout/sessions/{}", session_id))
            .await?;
        parse_checkout_session(value)
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let value = self
            .get_object(&format!("subscriptions/{}", subscription_id))
            .await?;
        parse_subscription(value)
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        immediate: bool,
    ) -> BillingResult<ProviderSubscription> {
        let sub_id = subscription_id.parse::<SubscriptionId>().map_err(|_| {
            BillingError::InvalidInput(format!("Invalid subscription ID: {}", subscription_id))
        })?;

        let subscription = if immediate {
            Subscription::cancel(&self.inner, &sub_id, CancelSubscription::default()).await?
        } else {
            let params = UpdateSubscription {
                cancel_at_period_end: Some(true),
                ..Default::default()
            };
            Subscription::update(&self.inner, &sub_id, params).await?
        };

        subscription_from_stripe(&subscription)
    }

    async fn find_active_promotion_code(&self, code: &str) -> BillingResult<Option<String>> {
        let promotion_codes = with_retry("list_promotion_codes", || {
            let params = ListPromotionCodes {
                active: Some(true),
                code: Some(code),
                limit: Some(1),
                ..Default::default()
            };
            async move { PromotionCode::list(&self.inner, &params).await }
        })
        .await?;

        Ok(promotion_codes.data.first().map(|p| p.id.to_string()))
    }

    async fn find_coupon(&self, code: &str) -> BillingResult<Option<String>> {
        if let Ok(coupon_id) = code.parse::<CouponId>() {
            let by_id = RetryIf::spawn(
                retry_strategy(),
                || Coupon::retrieve(&self.inner, &coupon_id, &[]),
                is_retryable_error,
            )
            .await;
            match by_id {
                Ok(coupon) if coupon.valid.unwrap_or(false) => return Ok(Some(coupon.id.to_string())),
                Ok(_) => return Ok(None),
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let coupons = with_retry("list_coupons", || {
            let params = ListCoupons {
                limit: Some(100),
                ..Default::default()
            };
            async move { Coupon::list(&self.inner, &params).await }
        })
        .await?;

        Ok(coupons
            .data
            .into_iter()
            .find(|c| {
                c.valid.unwrap_or(false)
                    && c.name
                        .as_deref()
                        .is_some_and(|name| name.eq_ignore_ascii_case(code))
            })
            .map(|c| c.id.to_string()))
    }

    async fn create_coupon(&self, coupon: NewCoupon) -> BillingResult<String> {
        let mut params = CreateCoupon::new();
        params.id = Some(&coupon.id);
        params.name = Some(&coupon.name);
        params.duration = Some(CouponDuration::Once);
        params.metadata = Some(coupon.metadata.clone());

        match &coupon.amount {
            CouponAmount::PercentOff(percent) => params.percent_off = Some(*percent),
            CouponAmount::AmountOff { cents, currency } => {
                let currency = currency.parse::<stripe::Currency>().map_err(|_| {
                    BillingError::InvalidInput(format!("Unsupported currency: {}", currency))
                })?;
                params.amount_off = Some(*cents);
                params.currency = Some(currency);
            }
        }

        match Coupon::create(&self.inner, params).await {
            Ok(created) => Ok(created.id.to_string()),
            Err(StripeError::Stripe(request_error))
                if matches!(
                    request_error.code,
                    Some(stripe::ErrorCode::ResourceAlreadyExists)
                ) =>
            {
                Err(BillingError::CouponAlreadyExists(coupon.id))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(is_retryable_error(&StripeError::Timeout));
        assert!(!is_retryable_error(&StripeError::ClientError("bad".into())));
        assert!(RawFailure::Status(429, String::new()).is_retryable());
        assert!(RawFailure::Status(503, String::new()).is_retryable());
        assert!(!RawFailure::Status(400, String::new()).is_retryable());
    }

    #[test]
    fn test_retry_strategy_is_bounded() {
        let delays: Vec<Duration> = retry_strategy().collect();
        assert_eq!(delays.len(), 3);
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(2)));
    }
}
