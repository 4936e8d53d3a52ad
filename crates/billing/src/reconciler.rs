//! Plan Reconciler
//!
//! Keeps the persisted `plans` table in step with the catalog and detects catalog drift.
//!
//! Sync is one-directional: the catalog wins. It runs at startup before entitlement checks are
//! served and again on a schedule. Drift detection never repairs anything; an entitling
//! subscription on a price the catalog does not know about needs an operator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pixquota_shared::{PlanCode, UserId};
use serde::Serialize;

use crate::catalog::PlanCatalog;
use crate::error::{BillingError, BillingResult};
use crate::store::{PlanRepository, SubscriptionRepository, UpsertOutcome};

const RETRY_BASE_MILLIS: u64 = 2;
const RETRY_FACTOR: u64 = 100;
const RETRY_MAX_DELAY: Duration = Duration::from_secs(10);

/// An entitling subscription whose price id is not in the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceMismatch {
    pub user_id: UserId,
    pub subscription_id: String,
    pub price_id: Option<String>,
}

/// Outcome of a plan sync, by plan code
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub created: Vec<PlanCode>,
    pub updated: Vec<PlanCode>,
    pub unchanged: Vec<PlanCode>,
    /// Catalog entries without a configured price id
    pub skipped: Vec<PlanCode>,
}

impl SyncReport {
    /// Rows written by the sync
    pub fn writes(&self) -> usize {
        self.created.len() + self.updated.len()
    }
}

pub struct PlanReconciler {
    catalog: PlanCatalog,
    plans: Arc<dyn PlanRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
}

impl PlanReconciler {
    pub fn new(
        catalog: PlanCatalog,
        plans: Arc<dyn PlanRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
    ) -> Self {
        Self {
            catalog,
            plans,
            subscriptions,
        }
    }

    /// Upsert every configured catalog plan by code. A run with no catalog change writes nothing.
    pub async fn sync_plans(&self) -> BillingResult<SyncReport> {
        let persisted: HashMap<PlanCode, _> = self
            .plans
            .list_plans()
            .await?
            .into_iter()
            .map(|plan| (plan.code.clone(), plan))
            .collect();

        let mut report = SyncReport::default();

        for entry in self.catalog.entries() {
            let Some(plan) = entry.to_plan() else {
                tracing::warn!(plan_code = %entry.code, "Plan has no price id configured, skipping sync");
                report.skipped.push(entry.code.clone());
                continue;
            };

            if persisted.get(&plan.code) == Some(&plan) {
                report.unchanged.push(plan.code);
                continue;
            }

            match self.plans.upsert_plan(&plan).await? {
                UpsertOutcome::Created => {
                    tracing::info!(
                        plan_code = %plan.code,
                        price_id = %plan.price_id,
                        monthly_limit = %plan.monthly_limit,
                        "Plan created"
                    );
                    report.created.push(plan.code);
                }
                UpsertOutcome::Updated => {
                    tracing::info!(
                        plan_code = %plan.code,
                        price_id = %plan.price_id,
                        monthly_limit = %plan.monthly_limit,
                        "Plan updated"
                    );
                    report.updated.push(plan.code);
                }
                UpsertOutcome::Unchanged => report.unchanged.push(plan.code),
            }
        }

        tracing::info!(
            created = report.created.len(),
            updated = report.updated.len(),
            unchanged = report.unchanged.len(),
            skipped = report.skipped.len(),
            "Plan sync complete"
        );

        Ok(report)
    }

    /// [`Self::sync_plans`] retried with jittered exponential backoff on transient failures
    pub async fn sync_plans_with_retry(&self, max_retries: usize) -> BillingResult<SyncReport> {
        use tokio_retry::strategy::{jitter, ExponentialBackoff};
        use tokio_retry::Retry;

        let retry_strategy = ExponentialBackoff::from_millis(RETRY_BASE_MILLIS)
            .factor(RETRY_FACTOR)
            .max_delay(RETRY_MAX_DELAY)
            .take(max_retries)
            .map(jitter);

        Retry::spawn(retry_strategy, || async {
            let result = self.sync_plans().await;

            match &result {
                Ok(_) => Ok(result),
                Err(e) if e.is_retryable() => {
                    tracing::warn!(error = %e, "Plan sync failed, will retry");
                    Err(result)
                }
                Err(_) => Ok(result),
            }
        })
        .await
        .unwrap_or_else(|e| e)
    }

    /// Check every entitling subscription's price id against the catalog.
    ///
    /// Returns the number of subscriptions checked, or [`BillingError::CatalogDrift`] listing the
    /// offenders.
    pub async fn validate_price_ids(&self) -> BillingResult<usize> {
        let subscriptions = self.subscriptions.list_entitling().await?;

        let mismatches: Vec<PriceMismatch> = subscriptions
            .iter()
            .filter(|sub| {
                !sub.price_id
                    .as_deref()
                    .is_some_and(|price_id| self.catalog.contains_price(price_id))
            })
            .map(|sub| PriceMismatch {
                user_id: sub.user_id,
                subscription_id: sub.external_subscription_id.clone(),
                price_id: sub.price_id.clone(),
            })
            .collect();

        if mismatches.is_empty() {
            tracing::info!(checked = subscriptions.len(), "Subscription price ids match catalog");
            return Ok(subscriptions.len());
        }

        for mismatch in &mismatches {
            tracing::error!(
                user_id = %mismatch.user_id,
                subscription_id = %mismatch.subscription_id,
                price_id = ?mismatch.price_id,
                "Entitling subscription references a price id missing from the plan catalog"
            );
        }

        Err(BillingError::CatalogDrift(mismatches))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogEntry, Plan, Quota};
    use crate::store::{MockPlanRepository, MockSubscriptionRepository};
    use crate::subscription::SubscriptionRecord;
    use mockall::Sequence;
    use pixquota_shared::SubscriptionStatus;
    use time::macros::datetime;
    use uuid::Uuid;

    fn code(raw: &str) -> PlanCode {
        PlanCode::parse(raw).unwrap()
    }

    fn catalog() -> PlanCatalog {
        PlanCatalog::new(vec![
            CatalogEntry::new(code("free"), Some("price_free".into()), Quota::Limited(100)),
            CatalogEntry::new(code("pro"), Some("price_pro".into()), Quota::Limited(200)),
            CatalogEntry::new(code("business"), None, Quota::Limited(1000)),
        ])
        .unwrap()
    }

    fn plan(raw: &str, price: &str, limit: u64) -> Plan {
        Plan {
            code: code(raw),
            price_id: price.into(),
            monthly_limit: Quota::Limited(limit),
        }
    }

    fn subscription(id: &str, price: Option<&str>) -> SubscriptionRecord {
        SubscriptionRecord {
            id: Uuid::new_v4(),
            user_id: UserId::new(),
            external_subscription_id: id.into(),
            external_customer_id: None,
            status: SubscriptionStatus::Active,
            price_id: price.map(String::from),
            current_period_start: None,
            current_period_end: None,
            cancel_at: None,
            canceled_at: None,
            cancel_at_period_end: false,
            created_at: None,
            updated_at: datetime!(2024-01-01 0:00 UTC),
            last_event_at: None,
        }
    }

    fn reconciler(plans: MockPlanRepository, subs: MockSubscriptionRepository) -> PlanReconciler {
        PlanReconciler::new(catalog(), Arc::new(plans), Arc::new(subs))
    }

    #[tokio::test]
    async fn test_sync_writes_only_changed_plans() {
        let mut plans = MockPlanRepository::new();
        plans.expect_list_plans().returning(|| {
            Ok(vec![plan("free", "price_free", 100), plan("pro", "price_pro", 150)])
        });
        plans
            .expect_upsert_plan()
            .withf(|p| p.code.as_str() == "pro" && p.monthly_limit == Quota::Limited(200))
            .times(1)
            .returning(|_| Ok(UpsertOutcome::Updated));

        let report = reconciler(plans, MockSubscriptionRepository::new())
            .sync_plans()
            .await
            .unwrap();

        assert_eq!(report.updated, vec![code("pro")]);
        assert_eq!(report.unchanged, vec![code("free")]);
        assert_eq!(report.skipped, vec![code("business")]);
        assert_eq!(report.writes(), 1);
    }

    #[tokio::test]
    async fn test_sync_creates_missing_plans() {
        let mut plans = MockPlanRepository::new();
        plans.expect_list_plans().returning(|| Ok(vec![]));
        plans
            .expect_upsert_plan()
            .times(2)
            .returning(|_| Ok(UpsertOutcome::Created));

        let report = reconciler(plans, MockSubscriptionRepository::new())
            .sync_plans()
            .await
            .unwrap();
        assert_eq!(report.created, vec![code("free"), code("pro")]);
    }

    #[tokio::test]
    async fn test_sync_retries_transient_failures() {
        let mut seq = Sequence::new();
        let mut plans = MockPlanRepository::new();
        plans
            .expect_list_plans()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(BillingError::Database("connection refused".into())));
        plans
            .expect_list_plans()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(vec![plan("free", "price_free", 100), plan("pro", "price_pro", 200)]));

        let report = reconciler(plans, MockSubscriptionRepository::new())
            .sync_plans_with_retry(3)
            .await
            .unwrap();
        assert_eq!(report.writes(), 0);
    }

    #[tokio::test]
    async fn test_sync_does_not_retry_permanent_failures() {
        let mut plans = MockPlanRepository::new();
        plans
            .expect_list_plans()
            .times(1)
            .returning(|| Err(BillingError::Config("bad".into())));

        let result = reconciler(plans, MockSubscriptionRepository::new())
            .sync_plans_with_retry(3)
            .await;
        assert!(matches!(result, Err(BillingError::Config(_))));
    }

    #[tokio::test]
    async fn test_validate_price_ids_ok() {
        let mut subs = MockSubscriptionRepository::new();
        subs.expect_list_entitling().returning(|| {
            Ok(vec![
                subscription("sub_1", Some("price_pro")),
                subscription("sub_2", Some("price_free")),
            ])
        });

        let checked = reconciler(MockPlanRepository::new(), subs)
            .validate_price_ids()
            .await
            .unwrap();
        assert_eq!(checked, 2);
    }

    #[tokio::test]
    async fn test_validate_price_ids_reports_drift() {
        let mut subs = MockSubscriptionRepository::new();
        subs.expect_list_entitling().returning(|| {
            Ok(vec![
                subscription("sub_ok", Some("price_pro")),
                subscription("sub_legacy", Some("price_legacy")),
                subscription("sub_none", None),
            ])
        });

        let err = reconciler(MockPlanRepository::new(), subs)
            .validate_price_ids()
            .await
            .unwrap_err();

        match err {
            BillingError::CatalogDrift(mismatches) => {
                let ids: Vec<_> = mismatches.iter().map(|m| m.subscription_id.as_str()).collect();
                assert_eq!(ids, vec!["sub_legacy", "sub_none"]);
            }
            other => panic!("expected catalog drift, got {:?}", other),
        }
    }
}
