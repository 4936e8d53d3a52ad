// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! pixquota Billing Module
//!
//! Subscription-aware usage accounting and plan reconciliation for metered image processing.
//!
//! ## Features
//!
//! - **Usage Accounting**: `get_usage` / `can_create_image` against the user's plan quota
//! - **Plan Resolution**: explicit assignment, else most recent entitling subscription, else free
//! - **Billing Periods**: processor-reported bounds, else the UTC calendar month
//! - **Plan Sync**: idempotent catalog to `plans` table reconciliation and drift detection
//! - **Webhooks**: signature verification and exactly-once lifecycle event application

pub mod accounting;
pub mod catalog;
pub mod config;
pub mod error;
pub mod events;
pub mod reconciler;
pub mod resolver;
pub mod signature;
pub mod store;
pub mod subscription;
pub mod usage;
pub mod webhooks;

// Accounting
pub use accounting::UsageAccounting;

// Catalog
pub use catalog::{CatalogEntry, Plan, PlanCatalog, Quota, FREE_PLAN_CODE};

// Config
pub use config::BillingConfig;

// Error
pub use error::{BillingError, BillingResult, ErrorKind};

// Events
pub use events::{
    CheckoutSnapshot, EventPayload, InvoiceSnapshot, LifecycleEvent, LifecycleEventType,
    SubscriptionSnapshot,
};

// Reconciler
pub use reconciler::{PlanReconciler, PriceMismatch, SyncReport};

// Resolver
pub use resolver::{
    calendar_month, BillingPeriod, PeriodSource, PlanSource, Resolution, ResolvedPlan,
    UsagePeriodResolver,
};

// Signature
pub use signature::SignatureVerifier;

// Store
pub use store::{
    BillingStore, CommitOutcome, CustomerLink, EventEffect, EventLedger, InMemoryBillingStore,
    PgBillingStore, PlanRepository, ProcessedEvent, SubscriptionRepository, UpsertOutcome,
    UsageRepository,
};

// Subscription
pub use subscription::{most_recent_entitling, OrderingPolicy, SubscriptionChange, SubscriptionRecord};

// Usage
pub use usage::{UsageCounter, UsageSnapshot};

// Webhooks
pub use webhooks::{ApplyOutcome, WebhookEventApplier, MIN_LEDGER_RETENTION};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub usage: UsageAccounting,
    pub reconciler: PlanReconciler,
    pub webhooks: WebhookEventApplier,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Ok(Self::new(BillingConfig::from_env()?, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: BillingConfig, pool: PgPool) -> Self {
        Self::with_store(config, Arc::new(PgBillingStore::new(pool)))
    }

    /// Create a billing service over any store
    pub fn with_store<S>(config: BillingConfig, store: Arc<S>) -> Self
    where
        S: BillingStore + 'static,
    {
        let verifier = config.signature_verifier();

        Self {
            usage: UsageAccounting::new(
                config.catalog.clone(),
                store.clone(),
                store.clone(),
                store.clone(),
            ),
            reconciler: PlanReconciler::new(config.catalog.clone(), store.clone(), store.clone()),
            webhooks: WebhookEventApplier::new(store.clone(), store, verifier, config.ordering),
        }
    }
}
