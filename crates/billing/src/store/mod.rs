//! Storage seams
//!
//! Every component reaches persistence through one of these traits. [`PgBillingStore`] is the
//! production implementation; [`InMemoryBillingStore`] mirrors its semantics for development and
//! tests.

mod memory;
mod postgres;

pub use memory::InMemoryBillingStore;
pub use postgres::PgBillingStore;

use async_trait::async_trait;
use pixquota_shared::{PlanCode, UserId};
use time::OffsetDateTime;

use crate::catalog::Plan;
use crate::error::BillingResult;
use crate::subscription::{OrderingPolicy, SubscriptionChange, SubscriptionRecord};

/// Result of writing a plan row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    /// Row already matched; nothing written
    Unchanged,
}

/// Ledger entry for an applied event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedEvent {
    pub event_id: String,
    pub event_type: String,
    pub event_created_at: OffsetDateTime,
}

/// Customer to user mapping learned from a completed checkout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerLink {
    pub external_customer_id: String,
    pub user_id: UserId,
}

/// State change committed together with a ledger entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventEffect {
    /// Record only
    None,
    Subscription(SubscriptionChange),
    Customer(CustomerLink),
}

/// Result of [`EventLedger::commit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Event recorded and its effect applied
    Recorded,
    /// Event id already in the ledger; nothing written
    Duplicate,
    /// Event recorded, effect skipped by the ordering policy
    Stale,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlanRepository: Send + Sync {
    async fn find_plan(&self, code: &PlanCode) -> BillingResult<Option<Plan>>;

    async fn list_plans(&self) -> BillingResult<Vec<Plan>>;

    /// Insert or update by code. Writes nothing when the row already matches.
    async fn upsert_plan(&self, plan: &Plan) -> BillingResult<UpsertOutcome>;

    async fn find_assigned_plan(&self, user_id: &UserId) -> BillingResult<Option<Plan>>;

    /// Grant a persisted plan to a user, replacing any previous grant
    async fn assign_plan(&self, user_id: &UserId, code: &PlanCode) -> BillingResult<()>;

    /// Returns whether a grant existed
    async fn revoke_plan(&self, user_id: &UserId) -> BillingResult<bool>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn list_entitling_for_user(&self, user_id: &UserId) -> BillingResult<Vec<SubscriptionRecord>>;

    /// Every entitling subscription, across users
    async fn list_entitling(&self) -> BillingResult<Vec<SubscriptionRecord>>;

    async fn find_by_external_id(&self, external_subscription_id: &str) -> BillingResult<Option<SubscriptionRecord>>;

    async fn find_user_for_customer(&self, external_customer_id: &str) -> BillingResult<Option<UserId>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventLedger: Send + Sync {
    async fn is_processed(&self, event_id: &str) -> BillingResult<bool>;

    /// Record the event and apply its effect atomically.
    ///
    /// Either both happen or neither does. Concurrent commits of the same event id race on the
    /// ledger key and the loser sees [`CommitOutcome::Duplicate`].
    async fn commit(
        &self,
        event: &ProcessedEvent,
        effect: &EventEffect,
        ordering: OrderingPolicy,
    ) -> BillingResult<CommitOutcome>;

    /// Delete entries processed before `cutoff`. Returns the number removed.
    async fn prune_processed_before(&self, cutoff: OffsetDateTime) -> BillingResult<u64>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UsageRepository: Send + Sync {
    /// Image creations by `user_id` in `[start, end)`
    async fn count_images(
        &self,
        user_id: &UserId,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BillingResult<u64>;
}

/// A store backing every repository
pub trait BillingStore: PlanRepository + SubscriptionRepository + EventLedger + UsageRepository {}

impl<T> BillingStore for T where T: PlanRepository + SubscriptionRepository + EventLedger + UsageRepository {}
