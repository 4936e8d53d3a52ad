//! Usage accounting facade
//!
//! The only entry points request handlers use. User ids and plan codes arrive as raw strings and
//! are validated here before any query runs. Request-path failures other than bad input are
//! logged in full and returned as [`BillingError::UsageUnavailable`].

use std::sync::Arc;

use pixquota_shared::{PlanCode, UserId};
use time::OffsetDateTime;

use crate::catalog::{Plan, PlanCatalog};
use crate::error::{BillingError, BillingResult};
use crate::resolver::UsagePeriodResolver;
use crate::store::{PlanRepository, SubscriptionRepository, UsageRepository};
use crate::usage::{UsageCounter, UsageSnapshot};

pub struct UsageAccounting {
    catalog: PlanCatalog,
    plans: Arc<dyn PlanRepository>,
    resolver: UsagePeriodResolver,
    counter: UsageCounter,
}

impl UsageAccounting {
    pub fn new(
        catalog: PlanCatalog,
        plans: Arc<dyn PlanRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        usage: Arc<dyn UsageRepository>,
    ) -> Self {
        Self {
            resolver: UsagePeriodResolver::new(catalog.clone(), plans.clone(), subscriptions),
            counter: UsageCounter::new(usage),
            catalog,
            plans,
        }
    }

    /// Usage in the user's current billing period
    pub async fn get_usage(&self, user_id: &str) -> BillingResult<UsageSnapshot> {
        self.get_usage_at(user_id, OffsetDateTime::now_utc()).await
    }

    pub async fn get_usage_at(&self, user_id: &str, now: OffsetDateTime) -> BillingResult<UsageSnapshot> {
        let user_id = UserId::parse(user_id)?;
        self.snapshot(&user_id, now)
            .await
            .map_err(|e| unavailable(&user_id, e))
    }

    /// Check, not a reservation: concurrent callers may both be admitted at the boundary
    pub async fn can_create_image(&self, user_id: &str) -> BillingResult<bool> {
        self.can_create_image_at(user_id, OffsetDateTime::now_utc())
            .await
    }

    pub async fn can_create_image_at(&self, user_id: &str, now: OffsetDateTime) -> BillingResult<bool> {
        let snapshot = self.get_usage_at(user_id, now).await?;
        let allowed = snapshot.can_create_image();
        if !allowed {
            tracing::info!(
                user_id = %user_id.trim(),
                plan_code = %snapshot.plan_code,
                used = snapshot.used,
                limit = %snapshot.limit,
                "Image quota exhausted"
            );
        }
        Ok(allowed)
    }

    /// Persisted plan row, else the catalog definition
    pub async fn get_plan_by_code(&self, code: &str) -> BillingResult<Plan> {
        let code = PlanCode::parse(code)?;

        if let Some(plan) = self.plans.find_plan(&code).await? {
            return Ok(plan);
        }

        match self.catalog.entry_for_code(&code) {
            Some(entry) => entry.to_plan().ok_or_else(|| {
                BillingError::Config(format!("plan '{}' has no price id configured", code))
            }),
            None => Err(BillingError::NotFound(format!("plan '{}'", code))),
        }
    }

    /// Grant a persisted plan to a user, overriding subscription matching
    pub async fn assign_plan(&self, user_id: &str, code: &str) -> BillingResult<Plan> {
        let user_id = UserId::parse(user_id)?;
        let code = PlanCode::parse(code)?;

        let plan = self
            .plans
            .find_plan(&code)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("plan '{}'", code)))?;
        self.plans.assign_plan(&user_id, &code).await?;

        tracing::info!(user_id = %user_id, plan_code = %code, "Plan assigned");
        Ok(plan)
    }

    /// Returns whether a grant was removed
    pub async fn revoke_plan(&self, user_id: &str) -> BillingResult<bool> {
        let user_id = UserId::parse(user_id)?;
        let removed = self.plans.revoke_plan(&user_id).await?;
        if removed {
            tracing::info!(user_id = %user_id, "Plan assignment revoked");
        }
        Ok(removed)
    }

    async fn snapshot(&self, user_id: &UserId, now: OffsetDateTime) -> BillingResult<UsageSnapshot> {
        let resolution = self.resolver.resolve_at(user_id, now).await?;
        let used = self.counter.count(user_id, &resolution.period).await?;

        tracing::debug!(
            user_id = %user_id,
            plan_code = %resolution.plan.plan.code,
            period_source = resolution.period.source.as_str(),
            used,
            "Usage computed"
        );

        Ok(UsageSnapshot::new(&resolution, used))
    }
}

fn unavailable(user_id: &UserId, err: BillingError) -> BillingError {
    if let BillingError::InvalidInput(_) = err {
        return err;
    }
    tracing::error!(
        user_id = %user_id,
        error = %err,
        kind = ?err.kind(),
        "Unable to determine usage"
    );
    BillingError::UsageUnavailable
}
