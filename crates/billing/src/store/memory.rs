//! In-memory store
//!
//! Same semantics as the PostgreSQL store. One lock guards all state, so a commit is atomic.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use pixquota_shared::{PlanCode, UserId};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    CommitOutcome, EventEffect, EventLedger, PlanRepository, ProcessedEvent, SubscriptionRepository,
    UpsertOutcome, UsageRepository,
};
use crate::catalog::Plan;
use crate::error::{BillingError, BillingResult};
use crate::subscription::{OrderingPolicy, SubscriptionRecord};

#[derive(Debug, Clone)]
struct LedgerRow {
    processed_at: OffsetDateTime,
}

#[derive(Debug, Default)]
struct State {
    plans: BTreeMap<PlanCode, Plan>,
    plan_writes: u64,
    assignments: HashMap<UserId, PlanCode>,
    subscriptions: HashMap<String, SubscriptionRecord>,
    processed: HashMap<String, LedgerRow>,
    customers: HashMap<String, UserId>,
    images: Vec<(UserId, OffsetDateTime)>,
}

/// Process-local billing store
#[derive(Debug, Default)]
pub struct InMemoryBillingStore {
    state: RwLock<State>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an image creation, as the image service would
    pub async fn record_image(&self, user_id: UserId, created_at: OffsetDateTime) {
        self.state.write().await.images.push((user_id, created_at));
    }

    /// Seed a subscription row directly
    pub async fn insert_subscription(&self, record: SubscriptionRecord) {
        self.state
            .write()
            .await
            .subscriptions
            .insert(record.external_subscription_id.clone(), record);
    }

    /// Number of plan rows created or updated so far
    pub async fn plan_write_count(&self) -> u64 {
        self.state.read().await.plan_writes
    }

    pub async fn processed_event_count(&self) -> usize {
        self.state.read().await.processed.len()
    }
}

#[async_trait]
impl PlanRepository for InMemoryBillingStore {
    async fn find_plan(&self, code: &PlanCode) -> BillingResult<Option<Plan>> {
        Ok(self.state.read().await.plans.get(code).cloned())
    }

    async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        Ok(self.state.read().await.plans.values().cloned().collect())
    }

    async fn upsert_plan(&self, plan: &Plan) -> BillingResult<UpsertOutcome> {
        let mut state = self.state.write().await;
        let outcome = match state.plans.get(&plan.code) {
            None => UpsertOutcome::Created,
            Some(existing) if existing == plan => return Ok(UpsertOutcome::Unchanged),
            Some(_) => UpsertOutcome::Updated,
        };
        state.plans.insert(plan.code.clone(), plan.clone());
        state.plan_writes += 1;
        Ok(outcome)
    }

    async fn find_assigned_plan(&self, user_id: &UserId) -> BillingResult<Option<Plan>> {
        let state = self.state.read().await;
        Ok(state
            .assignments
            .get(user_id)
            .and_then(|code| state.plans.get(code))
            .cloned())
    }

    async fn assign_plan(&self, user_id: &UserId, code: &PlanCode) -> BillingResult<()> {
        let mut state = self.state.write().await;
        if !state.plans.contains_key(code) {
            return Err(BillingError::NotFound(format!("plan '{}'", code)));
        }
        state.assignments.insert(*user_id, code.clone());
        Ok(())
    }

    async fn revoke_plan(&self, user_id: &UserId) -> BillingResult<bool> {
        Ok(self.state.write().await.assignments.remove(user_id).is_some())
    }
}

#[async_trait]
impl SubscriptionRepository for InMemoryBillingStore {
    async fn list_entitling_for_user(&self, user_id: &UserId) -> BillingResult<Vec<SubscriptionRecord>> {
        Ok(self
            .state
            .read()
            .await
            .subscriptions
            .values()
            .filter(|s| &s.user_id == user_id && s.is_entitling())
            .cloned()
            .collect())
    }

    async fn list_entitling(&self) -> BillingResult<Vec<SubscriptionRecord>> {
        let state = self.state.read().await;
        let mut subs: Vec<_> = state
            .subscriptions
            .values()
            .filter(|s| s.is_entitling())
            .cloned()
            .collect();
        subs.sort_by(|a, b| a.external_subscription_id.cmp(&b.external_subscription_id));
        Ok(subs)
    }

    async fn find_by_external_id(&self, external_subscription_id: &str) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self
            .state
            .read()
            .await
            .subscriptions
            .get(external_subscription_id)
            .cloned())
    }

    async fn find_user_for_customer(&self, external_customer_id: &str) -> BillingResult<Option<UserId>> {
        Ok(self
            .state
            .read()
            .await
            .customers
            .get(external_customer_id)
            .copied())
    }
}

#[async_trait]
impl EventLedger for InMemoryBillingStore {
    async fn is_processed(&self, event_id: &str) -> BillingResult<bool> {
        Ok(self.state.read().await.processed.contains_key(event_id))
    }

    async fn commit(
        &self,
        event: &ProcessedEvent,
        effect: &EventEffect,
        ordering: OrderingPolicy,
    ) -> BillingResult<CommitOutcome> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if state.processed.contains_key(&event.event_id) {
            return Ok(CommitOutcome::Duplicate);
        }

        let now = OffsetDateTime::now_utc();
        let outcome = match effect {
            EventEffect::None => CommitOutcome::Recorded,
            EventEffect::Customer(link) => {
                state
                    .customers
                    .entry(link.external_customer_id.clone())
                    .or_insert(link.user_id);
                CommitOutcome::Recorded
            }
            EventEffect::Subscription(change) => {
                match state.subscriptions.get_mut(&change.external_subscription_id) {
                    Some(existing) => {
                        if ordering.admits(existing.last_event_at, change.event_at) {
                            change.apply_to(existing, now);
                            CommitOutcome::Recorded
                        } else {
                            CommitOutcome::Stale
                        }
                    }
                    None => {
                        let record = change.clone().into_record(Uuid::new_v4(), now);
                        state
                            .subscriptions
                            .insert(record.external_subscription_id.clone(), record);
                        CommitOutcome::Recorded
                    }
                }
            }
        };

        state
            .processed
            .insert(event.event_id.clone(), LedgerRow { processed_at: now });
        Ok(outcome)
    }

    async fn prune_processed_before(&self, cutoff: OffsetDateTime) -> BillingResult<u64> {
        let mut state = self.state.write().await;
        let before = state.processed.len();
        state.processed.retain(|_, row| row.processed_at >= cutoff);
        Ok((before - state.processed.len()) as u64)
    }
}

#[async_trait]
impl UsageRepository for InMemoryBillingStore {
    async fn count_images(
        &self,
        user_id: &UserId,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BillingResult<u64> {
        Ok(self
            .state
            .read()
            .await
            .images
            .iter()
            .filter(|(owner, at)| owner == user_id && *at >= start && *at < end)
            .count() as u64)
    }
}
