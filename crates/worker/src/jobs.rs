//! Maintenance jobs
//!
//! Each job logs its own outcome. Scheduled runs discard the returned result; one-shot commands
//! use it for the exit status.

use pixquota_billing::{BillingError, BillingResult, BillingService, SyncReport};
use time::Duration;
use tracing::{error, info};

/// Attempts for the startup plan sync
pub const STARTUP_SYNC_RETRIES: usize = 5;

/// Reconcile the plan catalog into the plans table
pub async fn sync_plans(billing: &BillingService) -> BillingResult<SyncReport> {
    match billing.reconciler.sync_plans().await {
        Ok(report) => Ok(report),
        Err(e) => {
            error!(error = %e, retryable = e.is_retryable(), "Plan sync failed");
            Err(e)
        }
    }
}

/// Startup sync, retried on transient store failures
pub async fn sync_plans_at_startup(billing: &BillingService) -> BillingResult<SyncReport> {
    let report = billing
        .reconciler
        .sync_plans_with_retry(STARTUP_SYNC_RETRIES)
        .await
        .inspect_err(|e| error!(error = %e, "Startup plan sync failed"))?;

    if !report.skipped.is_empty() {
        info!(
            skipped = ?report.skipped.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
            "Plans without a configured price id were not synced"
        );
    }
    Ok(report)
}

/// Check entitling subscriptions against the catalog
pub async fn validate_price_ids(billing: &BillingService) -> BillingResult<usize> {
    match billing.reconciler.validate_price_ids().await {
        Ok(checked) => Ok(checked),
        Err(BillingError::CatalogDrift(mismatches)) => {
            error!(
                mismatches = mismatches.len(),
                "Catalog drift detected, operator action required"
            );
            Err(BillingError::CatalogDrift(mismatches))
        }
        Err(e) => {
            error!(error = %e, "Price id validation failed");
            Err(e)
        }
    }
}

/// Drop processed-event ledger entries older than `retention`
pub async fn prune_ledger(billing: &BillingService, retention: Duration) -> BillingResult<u64> {
    match billing.webhooks.prune_ledger(retention).await {
        Ok(removed) => Ok(removed),
        Err(e) => {
            error!(error = %e, "Ledger pruning failed");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pixquota_billing::{
        BillingConfig, InMemoryBillingStore, SubscriptionRepository, SubscriptionRecord,
    };
    use pixquota_shared::{SubscriptionStatus, UserId};
    use std::sync::Arc;
    use uuid::Uuid;

    fn service(store: Arc<InMemoryBillingStore>) -> BillingService {
        let config = BillingConfig::from_source(|key| match key {
            "STRIPE_PRICE_FREE" => Some("price_free".to_string()),
            "STRIPE_PRICE_PRO" => Some("price_pro".to_string()),
            _ => None,
        })
        .unwrap();
        BillingService::with_store(config, store)
    }

    #[tokio::test]
    async fn test_startup_sync_then_scheduled_sync_is_noop() {
        let store = Arc::new(InMemoryBillingStore::new());
        let billing = service(store.clone());

        let first = sync_plans_at_startup(&billing).await.unwrap();
        assert_eq!(first.created.len(), 2);
        assert_eq!(first.skipped.len(), 1);

        let second = sync_plans(&billing).await.unwrap();
        assert_eq!(second.writes(), 0);
        assert_eq!(store.plan_write_count().await, 2);
    }

    #[tokio::test]
    async fn test_validate_reports_drift() {
        let store = Arc::new(InMemoryBillingStore::new());
        store
            .insert_subscription(SubscriptionRecord {
                id: Uuid::new_v4(),
                user_id: UserId::new(),
                external_subscription_id: "sub_legacy".into(),
                external_customer_id: None,
                status: SubscriptionStatus::Active,
                price_id: Some("price_legacy".into()),
                current_period_start: None,
                current_period_end: None,
                cancel_at: None,
                canceled_at: None,
                cancel_at_period_end: false,
                created_at: None,
                updated_at: time::OffsetDateTime::now_utc(),
                last_event_at: None,
            })
            .await;
        assert_eq!(store.list_entitling().await.unwrap().len(), 1);

        let billing = service(store);
        assert!(matches!(
            validate_price_ids(&billing).await,
            Err(BillingError::CatalogDrift(m)) if m.len() == 1
        ));
    }

    #[tokio::test]
    async fn test_prune_rejects_short_retention() {
        let billing = service(Arc::new(InMemoryBillingStore::new()));
        assert!(prune_ledger(&billing, Duration::hours(1)).await.is_err());
        assert_eq!(prune_ledger(&billing, Duration::hours(720)).await.unwrap(), 0);
    }
}
