//! Local mirror of processor subscriptions
//!
//! Records are created by the first lifecycle event that names them and patched by every later
//! one. Nothing here talks to storage; the store applies [`SubscriptionChange`] with the same
//! semantics as [`SubscriptionChange::apply_to`].

use std::fmt;
use std::str::FromStr;

use pixquota_shared::{SubscriptionStatus, UserId};
use time::OffsetDateTime;
use uuid::Uuid;

/// Persisted subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: UserId,
    pub external_subscription_id: String,
    pub external_customer_id: Option<String>,
    pub status: SubscriptionStatus,
    pub price_id: Option<String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    /// Creation time at the processor, when known
    pub created_at: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
    /// Creation time of the newest event applied to this row
    pub last_event_at: Option<OffsetDateTime>,
}

impl SubscriptionRecord {
    pub fn is_entitling(&self) -> bool {
        self.status.is_entitling()
    }

    /// Current period bounds, only when both are present and ordered
    pub fn billing_period(&self) -> Option<(OffsetDateTime, OffsetDateTime)> {
        match (self.current_period_start, self.current_period_end) {
            (Some(start), Some(end)) if start < end => Some((start, end)),
            _ => None,
        }
    }
}

/// Field-level patch carried by a subscription lifecycle event
///
/// `None` leaves the stored value alone. The cancellation timestamps are nullable upstream, so
/// `Some(None)` clears them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionChange {
    pub external_subscription_id: String,
    /// Owner used when the row is created. An existing row keeps its owner.
    pub user_id: UserId,
    pub external_customer_id: Option<String>,
    pub status: Option<SubscriptionStatus>,
    pub price_id: Option<String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at: Option<Option<OffsetDateTime>>,
    pub canceled_at: Option<Option<OffsetDateTime>>,
    pub cancel_at_period_end: Option<bool>,
    pub created_at: Option<OffsetDateTime>,
    /// Creation time of the event carrying this change
    pub event_at: OffsetDateTime,
}

impl SubscriptionChange {
    pub fn new(external_subscription_id: impl Into<String>, user_id: UserId, event_at: OffsetDateTime) -> Self {
        Self {
            external_subscription_id: external_subscription_id.into(),
            user_id,
            external_customer_id: None,
            status: None,
            price_id: None,
            current_period_start: None,
            current_period_end: None,
            cancel_at: None,
            canceled_at: None,
            cancel_at_period_end: None,
            created_at: None,
            event_at,
        }
    }

    /// Overwrite every field present on the change
    pub fn apply_to(&self, record: &mut SubscriptionRecord, now: OffsetDateTime) {
        if let Some(customer) = &self.external_customer_id {
            record.external_customer_id = Some(customer.clone());
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(price_id) = &self.price_id {
            record.price_id = Some(price_id.clone());
        }
        if let Some(start) = self.current_period_start {
            record.current_period_start = Some(start);
        }
        if let Some(end) = self.current_period_end {
            record.current_period_end = Some(end);
        }
        if let Some(cancel_at) = self.cancel_at {
            record.cancel_at = cancel_at;
        }
        if let Some(canceled_at) = self.canceled_at {
            record.canceled_at = canceled_at;
        }
        if let Some(flag) = self.cancel_at_period_end {
            record.cancel_at_period_end = flag;
        }
        if let Some(created_at) = self.created_at {
            record.created_at = Some(created_at);
        }
        record.updated_at = now;
        record.last_event_at = Some(match record.last_event_at {
            Some(last) if last > self.event_at => last,
            _ => self.event_at,
        });
    }

    /// First sighting of a subscription. Status defaults to `incomplete`.
    pub fn into_record(self, id: Uuid, now: OffsetDateTime) -> SubscriptionRecord {
        SubscriptionRecord {
            id,
            user_id: self.user_id,
            external_subscription_id: self.external_subscription_id,
            external_customer_id: self.external_customer_id,
            status: self.status.unwrap_or(SubscriptionStatus::Incomplete),
            price_id: self.price_id,
            current_period_start: self.current_period_start,
            current_period_end: self.current_period_end,
            cancel_at: self.cancel_at.flatten(),
            canceled_at: self.canceled_at.flatten(),
            cancel_at_period_end: self.cancel_at_period_end.unwrap_or(false),
            created_at: self.created_at,
            updated_at: now,
            last_event_at: Some(self.event_at),
        }
    }
}

/// Pick the subscription that decides a user's plan and billing period.
///
/// Only entitling subscriptions qualify. Newest `created_at` wins and a subscription without a
/// creation time never beats one with a creation time. Ties fall back to `updated_at`, then to the
/// external id so the choice is stable.
pub fn most_recent_entitling(subscriptions: &[SubscriptionRecord]) -> Option<&SubscriptionRecord> {
    subscriptions
        .iter()
        .filter(|s| s.is_entitling())
        .max_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.updated_at.cmp(&b.updated_at))
                .then_with(|| a.external_subscription_id.cmp(&b.external_subscription_id))
        })
}

/// How events that arrive after a newer event for the same subscription are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderingPolicy {
    /// Apply in arrival order; the last delivered event wins
    #[default]
    Arrival,
    /// Record but do not apply events older than the newest one already applied
    RejectStale,
}

impl OrderingPolicy {
    /// Whether an event created at `incoming` may change a row whose newest applied event was
    /// created at `last_applied`
    pub fn admits(&self, last_applied: Option<OffsetDateTime>, incoming: OffsetDateTime) -> bool {
        match self {
            OrderingPolicy::Arrival => true,
            OrderingPolicy::RejectStale => !matches!(last_applied, Some(last) if incoming < last),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderingPolicy::Arrival => "arrival",
            OrderingPolicy::RejectStale => "reject_stale",
        }
    }
}

impl fmt::Display for OrderingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "arrival" => Ok(OrderingPolicy::Arrival),
            "reject_stale" => Ok(OrderingPolicy::RejectStale),
            other => Err(format!(
                "unknown ordering policy '{}': expected 'arrival' or 'reject_stale'",
                other
            )),
        }
    }
}
