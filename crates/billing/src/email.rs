//! Billing email notifications
//!
//! Sends transactional billing emails through the Resend API. Delivery is
//! fire-and-forget from the caller's point of view: errors are returned so the
//! caller can record them, never retried here.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{BillingError, BillingResult};

const RESEND_API_URL: &str = "https://api.resend.com/emails";

/// What a notification is about
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationContext {
    PaymentFailed {
        invoice_id: String,
        amount_due_cents: Option<i64>,
        currency: Option<String>,
        attempt_count: Option<i64>,
        hosted_invoice_url: Option<String>,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, account_email: &str, context: &NotificationContext)
        -> BillingResult<()>;
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_key: String,
    pub from: String,
    pub app_base_url: String,
}

impl EmailConfig {
    /// `None` when `RESEND_API_KEY` is not set
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("RESEND_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())?;
        Some(Self {
            api_key,
            from: std::env::var("BILLING_EMAIL_FROM")
                .unwrap_or_else(|_| "Estate Billing <billing@estate.app>".to_string()),
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
        })
    }
}

#[derive(Serialize)]
struct ResendEmail<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: String,
    html: String,
}

/// Resend-backed notifier
#[derive(Clone)]
pub struct BillingEmailService {
    config: Option<EmailConfig>,
    http: reqwest::Client,
}

impl BillingEmailService {
    pub fn new(config: Option<EmailConfig>) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Self {
        let config = EmailConfig::from_env();
        if config.is_none() {
            tracing::warn!("Billing email notifications not configured (missing RESEND_API_KEY)");
        }
        Self::new(config)
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    fn render(config: &EmailConfig, context: &NotificationContext) -> (String, String) {
        match context {
            NotificationContext::PaymentFailed {
                invoice_id,
                amount_due_cents,
                currency,
                attempt_count,
                hosted_invoice_url,
            } => {
                let amount = match amount_due_cents {
                    Some(cents) => format!(
                        "{}.{:02} {}",
                        cents / 100,
                        cents % 100,
                        currency.as_deref().unwrap_or("usd").to_uppercase()
                    ),
                    None => "your subscription payment".to_string(),
                };
                let pay_link = hosted_invoice_url
                    .clone()
                    .unwrap_or_else(|| format!("{}/billing", config.app_base_url));
                let attempt = attempt_count
                    .map(|n| format!("<p>This was payment attempt {}.</p>", n))
                    .unwrap_or_default();
                (
                    "Action required: your payment failed".to_string(),
                    format!(
                        "<p>We could not collect {amount} for invoice {invoice_id}.</p>\
                         {attempt}\
                         <p>Your account has been suspended until payment succeeds. \
                         <a href=\"{pay_link}\">Update your payment details</a>.</p>"
                    ),
                )
            }
        }
    }
}

#[async_trait]
impl Notifier for BillingEmailService {
    async fn notify(
        &self,
        account_email: &str,
        context: &NotificationContext,
    ) -> BillingResult<()> {
        let Some(config) = &self.config else {
            tracing::debug!(email = %account_email, "Email not configured, skipping notification");
            return Ok(());
        };

        let (subject, html) = Self::render(config, context);
        let response = self
            .http
            .post(RESEND_API_URL)
            .bearer_auth(&config.api_key)
            .json(&ResendEmail {
                from: &config.from,
                to: [account_email],
                subject,
                html,
            })
            .send()
            .await
            .map_err(|e| BillingError::Notification(format!("Failed to call Resend: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Resend API rejected email");
            return Err(BillingError::Notification(format!(
                "Resend API error ({})",
                status
            )));
        }

        tracing::info!(email = %account_email, "Billing notification sent");
        Ok(())
    }
}
