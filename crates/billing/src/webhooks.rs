//! Webhook event application
//!
//! Applies subscription lifecycle events to the local subscription mirror exactly once.
//!
//! ## Guarantees
//!
//! - An event id already in the ledger is a no-op
//! - The ledger entry and the state change are committed in one transaction
//! - A failure leaves the event unrecorded so the processor redelivers it
//! - Unknown event types are recorded and otherwise ignored
//!
//! ## User attribution (first match wins)
//!
//! 1. `metadata.user_id` on the subscription
//! 2. Owner of the existing subscription row
//! 3. Customer mapping recorded by `checkout.session.completed`
//!
//! An event matching none of these is `NotFound` and is not recorded.

use std::sync::Arc;

use pixquota_shared::{SubscriptionStatus, UserId};
use time::{Duration, OffsetDateTime};

use crate::error::{BillingError, BillingResult};
use crate::events::{CheckoutSnapshot, EventPayload, LifecycleEvent, LifecycleEventType, SubscriptionSnapshot};
use crate::signature::SignatureVerifier;
use crate::store::{CommitOutcome, CustomerLink, EventEffect, EventLedger, ProcessedEvent, SubscriptionRepository};
use crate::subscription::OrderingPolicy;

/// The processor retries deliveries for up to three days
pub const MIN_LEDGER_RETENTION: Duration = Duration::hours(72);

/// Result of applying one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Recorded and applied
    Applied,
    /// Recorded; carries no state change
    Ignored,
    /// Already recorded; nothing changed
    Duplicate,
    /// Recorded; older than the newest applied event under `reject_stale`
    Stale,
}

pub struct WebhookEventApplier {
    ledger: Arc<dyn EventLedger>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    verifier: Option<SignatureVerifier>,
    ordering: OrderingPolicy,
}

impl WebhookEventApplier {
    pub fn new(
        ledger: Arc<dyn EventLedger>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        verifier: Option<SignatureVerifier>,
        ordering: OrderingPolicy,
    ) -> Self {
        Self {
            ledger,
            subscriptions,
            verifier,
            ordering,
        }
    }

    /// Verify, parse and apply a raw webhook delivery
    pub async fn apply_signed(&self, payload: &[u8], signature_header: &str) -> BillingResult<ApplyOutcome> {
        let verifier = self.verifier.as_ref().ok_or_else(|| {
            BillingError::Config("webhook signing secret is not configured".to_string())
        })?;
        verifier.verify(payload, signature_header, OffsetDateTime::now_utc())?;

        let event = LifecycleEvent::from_json(payload)?;
        self.apply(&event).await
    }

    /// Apply a parsed event
    pub async fn apply(&self, event: &LifecycleEvent) -> BillingResult<ApplyOutcome> {
        if self.ledger.is_processed(&event.id).await? {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Event already processed, skipping"
            );
            return Ok(ApplyOutcome::Duplicate);
        }

        let effect = match self.effect_for(event).await {
            Ok(effect) => effect,
            Err(e) => {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Event not applied"
                );
                return Err(e);
            }
        };
        let changes_state = !matches!(effect, EventEffect::None);

        let record = ProcessedEvent {
            event_id: event.id.clone(),
            event_type: event.event_type.as_str().to_string(),
            event_created_at: event.created,
        };

        let outcome = match self.ledger.commit(&record, &effect, self.ordering).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Failed to commit event"
                );
                return Err(e);
            }
        };

        Ok(match outcome {
            CommitOutcome::Duplicate => {
                tracing::info!(event_id = %event.id, "Event processed concurrently, skipping");
                ApplyOutcome::Duplicate
            }
            CommitOutcome::Stale => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    ordering = %self.ordering,
                    "Stale event recorded without applying"
                );
                ApplyOutcome::Stale
            }
            CommitOutcome::Recorded if changes_state => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Event applied"
                );
                ApplyOutcome::Applied
            }
            CommitOutcome::Recorded => {
                tracing::debug!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Event recorded with no state change"
                );
                ApplyOutcome::Ignored
            }
        })
    }

    /// Delete ledger entries older than `retention`. Retentions inside the processor's retry
    /// window are rejected.
    pub async fn prune_ledger(&self, retention: Duration) -> BillingResult<u64> {
        if retention < MIN_LEDGER_RETENTION {
            return Err(BillingError::InvalidInput(format!(
                "ledger retention must be at least {} hours, got {}",
                MIN_LEDGER_RETENTION.whole_hours(),
                retention
            )));
        }

        let cutoff = OffsetDateTime::now_utc() - retention;
        let removed = self.ledger.prune_processed_before(cutoff).await?;
        tracing::info!(removed, cutoff = %cutoff, "Pruned processed events");
        Ok(removed)
    }

    async fn effect_for(&self, event: &LifecycleEvent) -> BillingResult<EventEffect> {
        match &event.payload {
            EventPayload::Subscription(snapshot) => {
                let user_id = self.attribute(snapshot).await?;
                let mut change = snapshot.clone().into_change(user_id, event.created);
                if event.event_type == LifecycleEventType::SubscriptionDeleted {
                    change.status = Some(SubscriptionStatus::Canceled);
                }
                Ok(EventEffect::Subscription(change))
            }
            EventPayload::Checkout(session) => checkout_link(&event.id, session),
            EventPayload::Invoice(_) | EventPayload::Other => Ok(EventEffect::None),
        }
    }

    async fn attribute(&self, snapshot: &SubscriptionSnapshot) -> BillingResult<UserId> {
        if let Some(raw) = snapshot.user_ref.as_deref() {
            return Ok(UserId::parse(raw)?);
        }

        if let Some(existing) = self.subscriptions.find_by_external_id(&snapshot.id).await? {
            return Ok(existing.user_id);
        }

        if let Some(customer_id) = snapshot.customer_id.as_deref() {
            if let Some(user_id) = self.subscriptions.find_user_for_customer(customer_id).await? {
                return Ok(user_id);
            }
        }

        Err(BillingError::NotFound(format!(
            "no user for subscription '{}'",
            snapshot.id
        )))
    }
}

fn checkout_link(event_id: &str, session: &CheckoutSnapshot) -> BillingResult<EventEffect> {
    match (&session.customer_id, session.user_ref.as_deref()) {
        (Some(customer_id), Some(user_ref)) => Ok(EventEffect::Customer(CustomerLink {
            external_customer_id: customer_id.clone(),
            user_id: UserId::parse(user_ref)?,
        })),
        _ => {
            tracing::warn!(
                event_id = %event_id,
                session_id = %session.id,
                "Checkout session without customer or user reference"
            );
            Ok(EventEffect::None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::events::InvoiceSnapshot;
    use crate::store::{InMemoryBillingStore, MockEventLedger, MockSubscriptionRepository};
    use time::macros::datetime;

    fn applier(store: Arc<InMemoryBillingStore>) -> WebhookEventApplier {
        WebhookEventApplier::new(store.clone(), store, None, OrderingPolicy::Arrival)
    }

    fn subscription_event(id: &str, user: Option<UserId>, status: SubscriptionStatus) -> LifecycleEvent {
        LifecycleEvent {
            id: id.to_string(),
            event_type: LifecycleEventType::SubscriptionUpdated,
            created: datetime!(2024-06-01 0:00 UTC),
            payload: EventPayload::Subscription(SubscriptionSnapshot {
                id: "sub_1".into(),
                customer_id: Some("cus_1".into()),
                status: Some(status),
                price_id: Some("price_pro".into()),
                current_period_start: None,
                current_period_end: None,
                cancel_at: None,
                canceled_at: None,
                cancel_at_period_end: None,
                created_at: None,
                user_ref: user.map(|u| u.to_string()),
            }),
        }
    }

    #[tokio::test]
    async fn test_apply_then_duplicate() {
        let store = Arc::new(InMemoryBillingStore::new());
        let applier = applier(store.clone());
        let event = subscription_event("evt_1", Some(UserId::new()), SubscriptionStatus::Active);

        assert_eq!(applier.apply(&event).await.unwrap(), ApplyOutcome::Applied);
        let after_first = store.find_by_external_id("sub_1").await.unwrap();

        assert_eq!(applier.apply(&event).await.unwrap(), ApplyOutcome::Duplicate);
        let after_second = store.find_by_external_id("sub_1").await.unwrap();

        assert_eq!(after_first, after_second);
        assert_eq!(store.processed_event_count().await, 1);
    }

    #[tokio::test]
    async fn test_existing_owner_attributes_later_events() {
        let store = Arc::new(InMemoryBillingStore::new());
        let applier = applier(store.clone());
        let user = UserId::new();

        applier
            .apply(&subscription_event("evt_1", Some(user), SubscriptionStatus::Active))
            .await
            .unwrap();
        applier
            .apply(&subscription_event("evt_2", None, SubscriptionStatus::PastDue))
            .await
            .unwrap();

        let stored = store.find_by_external_id("sub_1").await.unwrap().unwrap();
        assert_eq!(stored.user_id, user);
        assert_eq!(stored.status, SubscriptionStatus::PastDue);
    }

    #[tokio::test]
    async fn test_unattributable_event_is_not_recorded() {
        let store = Arc::new(InMemoryBillingStore::new());
        let applier = applier(store.clone());

        let err = applier
            .apply(&subscription_event("evt_1", None, SubscriptionStatus::Active))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!store.is_processed("evt_1").await.unwrap());
    }

    #[tokio::test]
    async fn test_checkout_links_customer_for_later_events() {
        let store = Arc::new(InMemoryBillingStore::new());
        let applier = applier(store.clone());
        let user = UserId::new();

        let checkout = LifecycleEvent {
            id: "evt_checkout".into(),
            event_type: LifecycleEventType::CheckoutSessionCompleted,
            created: datetime!(2024-06-01 0:00 UTC),
            payload: EventPayload::Checkout(CheckoutSnapshot {
                id: "cs_1".into(),
                customer_id: Some("cus_1".into()),
                user_ref: Some(user.to_string()),
            }),
        };
        assert_eq!(applier.apply(&checkout).await.unwrap(), ApplyOutcome::Applied);

        applier
            .apply(&subscription_event("evt_sub", None, SubscriptionStatus::Active))
            .await
            .unwrap();
        let stored = store.find_by_external_id("sub_1").await.unwrap().unwrap();
        assert_eq!(stored.user_id, user);
    }

    #[tokio::test]
    async fn test_deleted_event_cancels() {
        let store = Arc::new(InMemoryBillingStore::new());
        let applier = applier(store.clone());
        let mut event = subscription_event("evt_del", Some(UserId::new()), SubscriptionStatus::Active);
        event.event_type = LifecycleEventType::SubscriptionDeleted;

        applier.apply(&event).await.unwrap();
        let stored = store.find_by_external_id("sub_1").await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Canceled);
    }

    #[tokio::test]
    async fn test_invoice_and_unknown_events_are_recorded_only() {
        let store = Arc::new(InMemoryBillingStore::new());
        let applier = applier(store.clone());

        let invoice = LifecycleEvent {
            id: "evt_inv".into(),
            event_type: LifecycleEventType::InvoicePaymentFailed,
            created: datetime!(2024-06-01 0:00 UTC),
            payload: EventPayload::Invoice(InvoiceSnapshot {
                id: "in_1".into(),
                customer_id: Some("cus_1".into()),
                subscription_id: Some("sub_1".into()),
            }),
        };
        let unknown = LifecycleEvent {
            id: "evt_unknown".into(),
            event_type: LifecycleEventType::Unknown("customer.created".into()),
            created: datetime!(2024-06-01 0:00 UTC),
            payload: EventPayload::Other,
        };

        assert_eq!(applier.apply(&invoice).await.unwrap(), ApplyOutcome::Ignored);
        assert_eq!(applier.apply(&unknown).await.unwrap(), ApplyOutcome::Ignored);
        assert!(store.is_processed("evt_inv").await.unwrap());
        assert!(store.is_processed("evt_unknown").await.unwrap());
        assert!(store.find_by_external_id("sub_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_failure_propagates() {
        let mut ledger = MockEventLedger::new();
        ledger.expect_is_processed().returning(|_| Ok(false));
        ledger
            .expect_commit()
            .returning(|_, _, _| Err(BillingError::Database("deadlock detected".into())));
        let subscriptions = MockSubscriptionRepository::new();

        let applier = WebhookEventApplier::new(
            Arc::new(ledger),
            Arc::new(subscriptions),
            None,
            OrderingPolicy::Arrival,
        );
        let err = applier
            .apply(&subscription_event("evt_1", Some(UserId::new()), SubscriptionStatus::Active))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_apply_signed_requires_secret() {
        let store = Arc::new(InMemoryBillingStore::new());
        let err = applier(store).apply_signed(b"{}", "t=1,v1=00").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_apply_signed_rejects_bad_signature() {
        let store = Arc::new(InMemoryBillingStore::new());
        let verifier = SignatureVerifier::new("whsec_test", std::time::Duration::from_secs(300));
        let applier = WebhookEventApplier::new(store.clone(), store.clone(), Some(verifier), OrderingPolicy::Arrival);

        let header = format!("t={},v1={}", OffsetDateTime::now_utc().unix_timestamp(), "ab".repeat(32));
        let err = applier.apply_signed(b"{}", &header).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Unauthenticated);
        assert_eq!(store.processed_event_count().await, 0);
    }

    #[tokio::test]
    async fn test_prune_ledger_enforces_retry_window() {
        let store = Arc::new(InMemoryBillingStore::new());
        let applier = applier(store);

        let err = applier.prune_ledger(Duration::hours(24)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(applier.prune_ledger(Duration::hours(72)).await.unwrap(), 0);
    }
}
