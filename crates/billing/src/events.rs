//! Stripe webhook event model
//!
//! Events are parsed with our own serde types rather than `stripe::Event`: the
//! generated types in async-stripe lag behind the API versions Stripe delivers
//! (for example `current_period_end` moving onto subscription items), and a
//! strict parse failure would reject an otherwise valid delivery.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer};

use crate::error::{BillingError, BillingResult};
use crate::provider::{ProviderCheckoutSession, ProviderSubscription};

/// Verified and parsed webhook event
#[derive(Debug, Clone, PartialEq)]
pub struct StripeEvent {
    pub id: String,
    pub event_type: String,
    /// Unix seconds at which Stripe created the event
    pub created: i64,
    pub payload: EventPayload,
    /// Raw JSON as delivered, kept for the ledger snapshot
    pub raw: serde_json::Value,
}

/// Closed set of event kinds the dispatcher understands
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    CheckoutSessionCompleted(ProviderCheckoutSession),
    SubscriptionCreated(ProviderSubscription),
    SubscriptionUpdated(ProviderSubscription),
    SubscriptionDeleted(ProviderSubscription),
    InvoicePaymentFailed(InvoiceSummary),
    InvoicePaymentSucceeded(InvoiceSummary),
    SubscriptionScheduleCreated(ScheduleSummary),
    Unrecognized,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvoiceSummary {
    pub id: String,
    pub customer_id: Option<String>,
    pub customer_email: Option<String>,
    pub subscription_id: Option<String>,
    pub amount_due: Option<i64>,
    pub currency: Option<String>,
    pub attempt_count: Option<i64>,
    pub hosted_invoice_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleSummary {
    pub id: String,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    /// Start of the first phase that begins in the future, if any
    pub next_phase_start: Option<i64>,
    pub next_phase_price_id: Option<String>,
    pub metadata: HashMap<String, String>,
}

// Wire types

#[derive(Deserialize)]
struct WireEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    created: i64,
    data: WireEventData,
}

#[derive(Deserialize)]
struct WireEventData {
    object: serde_json::Value,
}

/// Stripe fields that are either an id or an expanded object with an `id`
#[derive(Deserialize)]
#[serde(untagged)]
enum WireExpandable {
    Id(String),
    Object { id: String },
}

fn expandable_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<WireExpandable>::deserialize(deserializer)?;
    Ok(value.map(|v| match v {
        WireExpandable::Id(id) => id,
        WireExpandable::Object { id } => id,
    }))
}

fn metadata_map<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<HashMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Deserialize)]
struct WireCheckoutSession {
    id: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    payment_status: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    customer: Option<String>,
    #[serde(default)]
    customer_email: Option<String>,
    #[serde(default)]
    customer_details: Option<WireCustomerDetails>,
    #[serde(default, deserialize_with = "expandable_id")]
    subscription: Option<String>,
    #[serde(default, deserialize_with = "metadata_map")]
    metadata: HashMap<String, String>,
}

#[derive(Deserialize)]
struct WireCustomerDetails {
    #[serde(default)]
    email: Option<String>,
}

/// Subscription object, also used for direct API reads
#[derive(Deserialize)]
pub(crate) struct WireSubscription {
    id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    customer: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, deserialize_with = "metadata_map")]
    metadata: HashMap<String, String>,
    #[serde(default)]
    items: Option<WireList<WireSubscriptionItem>>,
    #[serde(default)]
    current_period_end: Option<i64>,
    #[serde(default)]
    cancel_at: Option<i64>,
    #[serde(default)]
    canceled_at: Option<i64>,
    #[serde(default)]
    ended_at: Option<i64>,
    #[serde(default)]
    cancel_at_period_end: bool,
    #[serde(default)]
    trial_end: Option<i64>,
}

#[derive(Deserialize)]
struct WireList<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Deserialize)]
struct WireSubscriptionItem {
    #[serde(default, deserialize_with = "expandable_id")]
    price: Option<String>,
    #[serde(default)]
    current_period_end: Option<i64>,
}

#[derive(Deserialize)]
struct WireInvoice {
    id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    customer: Option<String>,
    #[serde(default)]
    customer_email: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    subscription: Option<String>,
    /// Newer API versions nest the subscription under `parent`
    #[serde(default)]
    parent: Option<WireInvoiceParent>,
    #[serde(default)]
    amount_due: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    attempt_count: Option<i64>,
    #[serde(default)]
    hosted_invoice_url: Option<String>,
}

#[derive(Deserialize)]
struct WireInvoiceParent {
    #[serde(default)]
    subscription_details: Option<WireInvoiceSubscriptionDetails>,
}

#[derive(Deserialize)]
struct WireInvoiceSubscriptionDetails {
    #[serde(default, deserialize_with = "expandable_id")]
    subscription: Option<String>,
}

#[derive(Deserialize)]
struct WireSchedule {
    id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    customer: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    subscription: Option<String>,
    #[serde(default)]
    phases: Vec<WireSchedulePhase>,
    #[serde(default, deserialize_with = "metadata_map")]
    metadata: HashMap<String, String>,
}

#[derive(Deserialize)]
struct WireSchedulePhase {
    #[serde(default)]
    start_date: Option<i64>,
    #[serde(default)]
    items: Vec<WireSchedulePhaseItem>,
}

#[derive(Deserialize)]
struct WireSchedulePhaseItem {
    #[serde(default, deserialize_with = "expandable_id")]
    price: Option<String>,
}

impl From<WireCheckoutSession> for ProviderCheckoutSession {
    fn from(s: WireCheckoutSession) -> Self {
        let customer_email = s
            .customer_details
            .and_then(|d| d.email)
            .or(s.customer_email);
        ProviderCheckoutSession {
            id: s.id,
            url: s.url,
            status: s.status,
            payment_status: s.payment_status,
            customer_id: s.customer,
            customer_email,
            subscription_id: s.subscription,
            metadata: s.metadata,
        }
    }
}

impl From<WireSubscription> for ProviderSubscription {
    fn from(s: WireSubscription) -> Self {
        let first_item = s.items.and_then(|items| items.data.into_iter().next());
        let item_period_end = first_item.as_ref().and_then(|i| i.current_period_end);
        ProviderSubscription {
            id: s.id,
            customer_id: s.customer,
            status: s.status,
            price_id: first_item.and_then(|i| i.price),
            metadata: s.metadata,
            current_period_end: s.current_period_end.or(item_period_end),
            cancel_at: s.cancel_at,
            canceled_at: s.canceled_at,
            ended_at: s.ended_at,
            cancel_at_period_end: s.cancel_at_period_end,
            trial_end: s.trial_end,
        }
    }
}

impl From<WireInvoice> for InvoiceSummary {
    fn from(i: WireInvoice) -> Self {
        let nested_subscription = i
            .parent
            .and_then(|p| p.subscription_details)
            .and_then(|d| d.subscription);
        InvoiceSummary {
            id: i.id,
            customer_id: i.customer,
            customer_email: i.customer_email,
            subscription_id: i.subscription.or(nested_subscription),
            amount_due: i.amount_due,
            currency: i.currency,
            attempt_count: i.attempt_count,
            hosted_invoice_url: i.hosted_invoice_url,
        }
    }
}

impl WireSchedule {
    fn into_summary(self, now: i64) -> ScheduleSummary {
        let next_phase = self
            .phases
            .into_iter()
            .find(|p| p.start_date.is_some_and(|start| start > now));
        let (next_phase_start, next_phase_price_id) = match next_phase {
            Some(phase) => (
                phase.start_date,
                phase.items.into_iter().find_map(|item| item.price),
            ),
            None => (None, None),
        };
        ScheduleSummary {
            id: self.id,
            customer_id: self.customer,
            subscription_id: self.subscription,
            next_phase_start,
            next_phase_price_id,
            metadata: self.metadata,
        }
    }
}

/// Parse a subscription object returned by the Stripe API
pub(crate) fn parse_subscription(value: serde_json::Value) -> BillingResult<ProviderSubscription> {
    serde_json::from_value::<WireSubscription>(value)
        .map(ProviderSubscription::from)
        .map_err(|e| BillingError::StripeApi(format!("Failed to parse subscription: {}", e)))
}

/// Parse a checkout session object returned by the Stripe API
pub(crate) fn parse_checkout_session(
    value: serde_json::Value,
) -> BillingResult<ProviderCheckoutSession> {
    serde_json::from_value::<WireCheckoutSession>(value)
        .map(ProviderCheckoutSession::from)
        .map_err(|e| BillingError::StripeApi(format!("Failed to parse checkout session: {}", e)))
}

fn object<T: serde::de::DeserializeOwned>(
    event_type: &str,
    value: serde_json::Value,
) -> BillingResult<T> {
    serde_json::from_value(value).map_err(|e| {
        BillingError::WebhookPayloadInvalid(format!("{} object: {}", event_type, e))
    })
}

/// Parse a raw event body into a typed event
pub fn parse_event(raw: serde_json::Value) -> BillingResult<StripeEvent> {
    let wire: WireEvent = serde_json::from_value(raw.clone())
        .map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))?;
    let object_value = wire.data.object;

    let payload = match wire.event_type.as_str() {
        "checkout.session.completed" => EventPayload::CheckoutSessionCompleted(
            object::<WireCheckoutSession>(&wire.event_type, object_value)?.into(),
        ),
        "customer.subscription.created" => EventPayload::SubscriptionCreated(
            object::<WireSubscription>(&wire.event_type, object_value)?.into(),
        ),
        "customer.subscription.updated" => EventPayload::SubscriptionUpdated(
            object::<WireSubscription>(&wire.event_type, object_value)?.into(),
        ),
        "customer.subscription.deleted" => EventPayload::SubscriptionDeleted(
            object::<WireSubscription>(&wire.event_type, object_value)?.into(),
        ),
        "invoice.payment_failed" => EventPayload::InvoicePaymentFailed(
            object::<WireInvoice>(&wire.event_type, object_value)?.into(),
        ),
        "invoice.payment_succeeded" | "invoice.paid" => EventPayload::InvoicePaymentSucceeded(
            object::<WireInvoice>(&wire.event_type, object_value)?.into(),
        ),
        "subscription_schedule.created" => EventPayload::SubscriptionScheduleCreated(
            object::<WireSchedule>(&wire.event_type, object_value)?.into_summary(wire.created),
        ),
        _ => EventPayload::Unrecognized,
    };

    Ok(StripeEvent {
        id: wire.id,
        event_type: wire.event_type,
        created: wire.created,
        payload,
        raw,
    })
}

/// Parse the raw request body of a webhook delivery
pub fn parse_event_str(payload: &str) -> BillingResult<StripeEvent> {
    let raw: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))?;
    parse_event(raw)
}
