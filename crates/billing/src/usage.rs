//! Usage metering
//!
//! Counts image creations inside a billing period and turns the count into a snapshot against
//! the resolved plan's quota.

use std::sync::Arc;

use pixquota_shared::{PlanCode, UserId};
use serde::Serialize;
use time::OffsetDateTime;

use crate::catalog::Quota;
use crate::error::BillingResult;
use crate::resolver::{BillingPeriod, PeriodSource, Resolution};
use crate::store::UsageRepository;

/// Current billing period usage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub used: u64,
    pub limit: Quota,
    pub plan_code: PlanCode,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    pub period_source: PeriodSource,
    pub has_subscription: bool,
    /// `max(0, limit - used)`, or unlimited
    pub remaining: Quota,
}

impl UsageSnapshot {
    pub fn new(resolution: &Resolution, used: u64) -> Self {
        let limit = resolution.plan.plan.monthly_limit;
        Self {
            used,
            limit,
            plan_code: resolution.plan.plan.code.clone(),
            period_start: resolution.period.start,
            period_end: resolution.period.end,
            period_source: resolution.period.source,
            has_subscription: resolution.plan.has_entitling_subscription,
            remaining: limit.remaining_after(used),
        }
    }

    /// Whether one more image fits in the quota
    pub fn can_create_image(&self) -> bool {
        self.limit.admits(self.used)
    }
}

/// Usage metering service
#[derive(Clone)]
pub struct UsageCounter {
    usage: Arc<dyn UsageRepository>,
}

impl UsageCounter {
    pub fn new(usage: Arc<dyn UsageRepository>) -> Self {
        Self { usage }
    }

    /// Image creations in `period`
    pub async fn count(&self, user_id: &UserId, period: &BillingPeriod) -> BillingResult<u64> {
        self.usage
            .count_images(user_id, period.start, period.end)
            .await
    }
}
