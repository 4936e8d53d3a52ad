//! Lifecycle Events Module
//!
//! Typed view of the payment processor's webhook events.
//!
//! Only the envelope (`id`, `type`, `created`, `data.object`) and the handful of object fields the
//! engine acts on are parsed, so processor API version changes that add fields do not break
//! parsing.
//!
//! ## Event Types
//!
//! - Checkout: `checkout.session.completed` links a processor customer to a user
//! - Subscription lifecycle: created, updated, deleted
//! - Invoicing: payment succeeded, payment failed (recorded only)
//! - Anything else is accepted as [`LifecycleEventType::Unknown`]

use std::collections::HashMap;
use std::fmt;

use pixquota_shared::{SubscriptionStatus, UserId};
use serde::{Deserialize, Deserializer};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::subscription::SubscriptionChange;

/// Metadata key carrying our user id on processor objects
pub const USER_ID_METADATA_KEY: &str = "user_id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEventType {
    CheckoutSessionCompleted,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaymentSucceeded,
    InvoicePaymentFailed,
    Unknown(String),
}

impl LifecycleEventType {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "checkout.session.completed" => Self::CheckoutSessionCompleted,
            "customer.subscription.created" => Self::SubscriptionCreated,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "invoice.payment_succeeded" => Self::InvoicePaymentSucceeded,
            "invoice.payment_failed" => Self::InvoicePaymentFailed,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::CheckoutSessionCompleted => "checkout.session.completed",
            Self::SubscriptionCreated => "customer.subscription.created",
            Self::SubscriptionUpdated => "customer.subscription.updated",
            Self::SubscriptionDeleted => "customer.subscription.deleted",
            Self::InvoicePaymentSucceeded => "invoice.payment_succeeded",
            Self::InvoicePaymentFailed => "invoice.payment_failed",
            Self::Unknown(raw) => raw,
        }
    }

    pub fn is_subscription_event(&self) -> bool {
        matches!(
            self,
            Self::SubscriptionCreated | Self::SubscriptionUpdated | Self::SubscriptionDeleted
        )
    }
}

impl fmt::Display for LifecycleEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscription fields carried by a lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub id: String,
    pub customer_id: Option<String>,
    pub status: Option<SubscriptionStatus>,
    pub price_id: Option<String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    /// `Some(None)` when the field is present and null
    pub cancel_at: Option<Option<OffsetDateTime>>,
    pub canceled_at: Option<Option<OffsetDateTime>>,
    pub cancel_at_period_end: Option<bool>,
    pub created_at: Option<OffsetDateTime>,
    /// Raw `metadata.user_id`, unvalidated
    pub user_ref: Option<String>,
}

impl SubscriptionSnapshot {
    pub fn into_change(self, user_id: UserId, event_at: OffsetDateTime) -> SubscriptionChange {
        SubscriptionChange {
            external_subscription_id: self.id,
            user_id,
            external_customer_id: self.customer_id,
            status: self.status,
            price_id: self.price_id,
            current_period_start: self.current_period_start,
            current_period_end: self.current_period_end,
            cancel_at: self.cancel_at,
            canceled_at: self.canceled_at,
            cancel_at_period_end: self.cancel_at_period_end,
            created_at: self.created_at,
            event_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSnapshot {
    pub id: String,
    pub customer_id: Option<String>,
    /// `client_reference_id`, else `metadata.user_id`
    pub user_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceSnapshot {
    pub id: String,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    Subscription(SubscriptionSnapshot),
    Checkout(CheckoutSnapshot),
    Invoice(InvoiceSnapshot),
    Other,
}

/// A parsed webhook event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub id: String,
    pub event_type: LifecycleEventType,
    pub created: OffsetDateTime,
    pub payload: EventPayload,
}

impl LifecycleEvent {
    /// Parse a raw webhook body. Malformed payloads are `InvalidInput`.
    pub fn from_json(payload: &[u8]) -> BillingResult<Self> {
        let raw: RawEvent = serde_json::from_slice(payload).map_err(malformed)?;

        if raw.id.trim().is_empty() {
            return Err(BillingError::InvalidInput("event id is empty".to_string()));
        }

        let event_type = LifecycleEventType::parse(&raw.event_type);
        let created = timestamp(raw.created)?;
        let object = raw.data.object;

        let payload = match &event_type {
            t if t.is_subscription_event() => {
                let sub: RawSubscription = serde_json::from_value(object).map_err(malformed)?;
                EventPayload::Subscription(sub.into_snapshot()?)
            }
            LifecycleEventType::CheckoutSessionCompleted => {
                let session: RawCheckoutSession =
                    serde_json::from_value(object).map_err(malformed)?;
                EventPayload::Checkout(session.into_snapshot())
            }
            LifecycleEventType::InvoicePaymentSucceeded | LifecycleEventType::InvoicePaymentFailed => {
                let invoice: RawInvoice = serde_json::from_value(object).map_err(malformed)?;
                EventPayload::Invoice(invoice.into_snapshot())
            }
            _ => EventPayload::Other,
        };

        Ok(Self {
            id: raw.id,
            event_type,
            created,
            payload,
        })
    }
}

fn malformed(err: serde_json::Error) -> BillingError {
    BillingError::InvalidInput(format!("malformed event payload: {}", err))
}

fn timestamp(secs: i64) -> BillingResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|_| BillingError::InvalidInput(format!("timestamp out of range: {}", secs)))
}

fn optional_timestamp(secs: Option<i64>) -> BillingResult<Option<OffsetDateTime>> {
    secs.map(timestamp).transpose()
}

/// Distinguishes an absent field (`None`) from an explicit null (`Some(None)`)
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

// =============================================================================
// Wire shapes
// =============================================================================

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: RawEventData,
}

#[derive(Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

/// A reference that may be expanded into the full object
#[derive(Deserialize)]
#[serde(untagged)]
enum Expandable {
    Id(String),
    Object { id: String },
}

impl Expandable {
    fn into_id(self) -> String {
        match self {
            Expandable::Id(id) | Expandable::Object { id } => id,
        }
    }
}

#[derive(Deserialize)]
struct RawSubscription {
    id: String,
    #[serde(default)]
    customer: Option<Expandable>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    items: Option<RawList<RawSubscriptionItem>>,
    #[serde(default)]
    current_period_start: Option<i64>,
    #[serde(default)]
    current_period_end: Option<i64>,
    #[serde(default, deserialize_with = "present")]
    cancel_at: Option<Option<i64>>,
    #[serde(default, deserialize_with = "present")]
    canceled_at: Option<Option<i64>>,
    #[serde(default)]
    cancel_at_period_end: Option<bool>,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct RawList<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Deserialize)]
struct RawSubscriptionItem {
    #[serde(default)]
    price: Option<Expandable>,
    #[serde(default)]
    current_period_start: Option<i64>,
    #[serde(default)]
    current_period_end: Option<i64>,
}

impl RawSubscription {
    fn into_snapshot(self) -> BillingResult<SubscriptionSnapshot> {
        if self.id.trim().is_empty() {
            return Err(BillingError::InvalidInput("subscription id is empty".to_string()));
        }

        let status = self
            .status
            .as_deref()
            .map(str::parse::<SubscriptionStatus>)
            .transpose()?;

        let first_item = self.items.and_then(|list| list.data.into_iter().next());

        // Newer API versions moved the period bounds onto the subscription items
        let (item_start, item_end, price_id) = match first_item {
            Some(item) => (
                item.current_period_start,
                item.current_period_end,
                item.price.map(Expandable::into_id),
            ),
            None => (None, None, None),
        };

        Ok(SubscriptionSnapshot {
            id: self.id,
            customer_id: self.customer.map(Expandable::into_id),
            status,
            price_id,
            current_period_start: optional_timestamp(self.current_period_start.or(item_start))?,
            current_period_end: optional_timestamp(self.current_period_end.or(item_end))?,
            cancel_at: self.cancel_at.map(optional_timestamp).transpose()?,
            canceled_at: self.canceled_at.map(optional_timestamp).transpose()?,
            cancel_at_period_end: self.cancel_at_period_end,
            created_at: optional_timestamp(self.created)?,
            user_ref: self
                .metadata
                .and_then(|mut m| m.remove(USER_ID_METADATA_KEY)),
        })
    }
}

#[derive(Deserialize)]
struct RawCheckoutSession {
    id: String,
    #[serde(default)]
    customer: Option<Expandable>,
    #[serde(default)]
    client_reference_id: Option<String>,
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
}

impl RawCheckoutSession {
    fn into_snapshot(self) -> CheckoutSnapshot {
        let user_ref = self
            .client_reference_id
            .filter(|r| !r.trim().is_empty())
            .or_else(|| self.metadata.and_then(|mut m| m.remove(USER_ID_METADATA_KEY)));

        CheckoutSnapshot {
            id: self.id,
            customer_id: self.customer.map(Expandable::into_id),
            user_ref,
        }
    }
}

#[derive(Deserialize)]
struct RawInvoice {
    id: String,
    #[serde(default)]
    customer: Option<Expandable>,
    #[serde(default)]
    subscription: Option<Expandable>,
}

impl RawInvoice {
    fn into_snapshot(self) -> InvoiceSnapshot {
        InvoiceSnapshot {
            id: self.id,
            customer_id: self.customer.map(Expandable::into_id),
            subscription_id: self.subscription.map(Expandable::into_id),
        }
    }
}
