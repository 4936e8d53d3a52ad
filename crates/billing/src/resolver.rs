//! Usage Period Resolver
//!
//! Answers "which plan is this user on, and which window is their usage counted in?"
//!
//! ## Plan resolution (first match wins)
//!
//! 1. An explicit plan assignment
//! 2. The most recent entitling subscription whose price id is in the catalog
//! 3. The catalog's free plan, failing closed when its price id is not configured
//!
//! ## Billing period
//!
//! The selected entitling subscription's bounds when present and ordered, otherwise the current
//! UTC calendar month. The fallback is tagged [`PeriodSource::CalendarMonth`] and logged.

use std::sync::Arc;

use pixquota_shared::UserId;
use serde::Serialize;
use time::{Duration, OffsetDateTime, UtcOffset};

use crate::catalog::{Plan, PlanCatalog};
use crate::error::BillingResult;
use crate::store::{PlanRepository, SubscriptionRepository};
use crate::subscription::{most_recent_entitling, SubscriptionRecord};

/// What decided the plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    Assignment,
    Subscription,
    FreeFallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPlan {
    pub plan: Plan,
    pub has_entitling_subscription: bool,
    pub source: PlanSource,
}

/// Where the billing period bounds came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodSource {
    /// Bounds reported by the payment processor
    Subscription,
    /// No usable subscription bounds; current UTC calendar month
    CalendarMonth,
}

impl PeriodSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodSource::Subscription => "subscription",
            PeriodSource::CalendarMonth => "calendar_month",
        }
    }
}

/// Half-open `[start, end)` usage window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingPeriod {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
    pub source: PeriodSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub plan: ResolvedPlan,
    pub period: BillingPeriod,
}

/// `[first of month, first of next month)` in UTC
pub fn calendar_month(now: OffsetDateTime) -> (OffsetDateTime, OffsetDateTime) {
    let date = now.to_offset(UtcOffset::UTC).date();
    let first = date - Duration::days(i64::from(date.day()) - 1);
    let days = time::util::days_in_year_month(date.year(), date.month());
    let next = first + Duration::days(i64::from(days));
    (first.midnight().assume_utc(), next.midnight().assume_utc())
}

pub struct UsagePeriodResolver {
    catalog: PlanCatalog,
    plans: Arc<dyn PlanRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
}

impl UsagePeriodResolver {
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

    pub async fn resolve_plan(&self, user_id: &UserId) -> BillingResult<ResolvedPlan> {
        let assigned = self.plans.find_assigned_plan(user_id).await?;
        if let Some(plan) = assigned {
            return Ok(assigned_plan(plan));
        }

        let subs = self.subscriptions.list_entitling_for_user(user_id).await?;
        self.plan_for(user_id, most_recent_entitling(&subs))
    }

    pub async fn resolve_billing_period(&self, user_id: &UserId) -> BillingResult<BillingPeriod> {
        self.resolve_billing_period_at(user_id, OffsetDateTime::now_utc())
            .await
    }

    pub async fn resolve_billing_period_at(
        &self,
        user_id: &UserId,
        now: OffsetDateTime,
    ) -> BillingResult<BillingPeriod> {
        let subs = self.subscriptions.list_entitling_for_user(user_id).await?;
        Ok(period_for(user_id, most_recent_entitling(&subs), now))
    }

    /// Plan and period from a single subscription lookup
    pub async fn resolve_at(&self, user_id: &UserId, now: OffsetDateTime) -> BillingResult<Resolution> {
        let assigned = self.plans.find_assigned_plan(user_id).await?;
        let subs = self.subscriptions.list_entitling_for_user(user_id).await?;
        let selected = most_recent_entitling(&subs);

        let plan = match assigned {
            Some(plan) => assigned_plan(plan),
            None => self.plan_for(user_id, selected)?,
        };

        Ok(Resolution {
            plan,
            period: period_for(user_id, selected, now),
        })
    }

    fn plan_for(
        &self,
        user_id: &UserId,
        selected: Option<&SubscriptionRecord>,
    ) -> BillingResult<ResolvedPlan> {
        if let Some(sub) = selected {
            match sub.price_id.as_deref().and_then(|p| self.catalog.plan_for_price(p)) {
                Some(plan) => {
                    return Ok(ResolvedPlan {
                        plan,
                        has_entitling_subscription: true,
                        source: PlanSource::Subscription,
                    });
                }
                None => {
                    tracing::error!(
                        user_id = %user_id,
                        subscription_id = %sub.external_subscription_id,
                        price_id = ?sub.price_id,
                        "Entitling subscription price not in plan catalog, using free plan"
                    );
                }
            }
        }

        Ok(ResolvedPlan {
            plan: self.catalog.free_plan()?,
            has_entitling_subscription: false,
            source: PlanSource::FreeFallback,
        })
    }
}

fn assigned_plan(plan: Plan) -> ResolvedPlan {
    ResolvedPlan {
        plan,
        has_entitling_subscription: true,
        source: PlanSource::Assignment,
    }
}

fn period_for(
    user_id: &UserId,
    selected: Option<&SubscriptionRecord>,
    now: OffsetDateTime,
) -> BillingPeriod {
    if let Some((start, end)) = selected.and_then(SubscriptionRecord::billing_period) {
        if end <= now {
            // Renewal event not applied yet
            tracing::warn!(
                user_id = %user_id,
                period_end = %end,
                "Subscription billing period has already ended"
            );
        }
        return BillingPeriod {
            start,
            end,
            source: PeriodSource::Subscription,
        };
    }

    let (start, end) = calendar_month(now);
    tracing::warn!(
        user_id = %user_id,
        period_source = PeriodSource::CalendarMonth.as_str(),
        has_subscription = selected.is_some(),
        "No subscription billing period, falling back to calendar month"
    );
    BillingPeriod {
        start,
        end,
        source: PeriodSource::CalendarMonth,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogEntry, Quota};
    use crate::error::BillingError;
    use crate::store::{MockPlanRepository, MockSubscriptionRepository};
    use pixquota_shared::{PlanCode, SubscriptionStatus};
    use time::macros::datetime;
    use uuid::Uuid;

    fn code(raw: &str) -> PlanCode {
        PlanCode::parse(raw).unwrap()
    }

    fn catalog(free_price: Option<&str>) -> PlanCatalog {
        PlanCatalog::new(vec![
            CatalogEntry::new(code("free"), free_price.map(String::from), Quota::Limited(100)),
            CatalogEntry::new(code("pro"), Some("price_pro".into()), Quota::Limited(200)),
            CatalogEntry::new(code("business"), Some("price_business".into()), Quota::Limited(1000)),
        ])
        .unwrap()
    }

    fn subscription(price: &str, created_at: OffsetDateTime) -> SubscriptionRecord {
        SubscriptionRecord {
            id: Uuid::new_v4(),
            user_id: UserId::new(),
            external_subscription_id: format!("sub_{}", price),
            external_customer_id: None,
            status: SubscriptionStatus::Active,
            price_id: Some(price.to_string()),
            current_period_start: None,
            current_period_end: None,
            cancel_at: None,
            canceled_at: None,
            cancel_at_period_end: false,
            created_at: Some(created_at),
            updated_at: created_at,
            last_event_at: None,
        }
    }

    fn resolver(
        catalog: PlanCatalog,
        assigned: Option<Plan>,
        subs: Vec<SubscriptionRecord>,
    ) -> UsagePeriodResolver {
        let mut plans = MockPlanRepository::new();
        plans
            .expect_find_assigned_plan()
            .returning(move |_| Ok(assigned.clone()));
        let mut subscriptions = MockSubscriptionRepository::new();
        subscriptions
            .expect_list_entitling_for_user()
            .returning(move |_| Ok(subs.clone()));
        UsagePeriodResolver::new(catalog, Arc::new(plans), Arc::new(subscriptions))
    }

    #[test]
    fn test_calendar_month() {
        let (start, end) = calendar_month(datetime!(2024-02-15 13:45 UTC));
        assert_eq!(start, datetime!(2024-02-01 0:00 UTC));
        assert_eq!(end, datetime!(2024-03-01 0:00 UTC));

        let (start, end) = calendar_month(datetime!(2024-12-31 23:59:59 UTC));
        assert_eq!(start, datetime!(2024-12-01 0:00 UTC));
        assert_eq!(end, datetime!(2025-01-01 0:00 UTC));
    }

    #[test]
    fn test_calendar_month_uses_utc() {
        // 2024-03-01 01:00 at +02:00 is still February in UTC
        let (start, _) = calendar_month(datetime!(2024-03-01 1:00 +2));
        assert_eq!(start, datetime!(2024-02-01 0:00 UTC));
    }

    #[tokio::test]
    async fn test_free_fallback_without_subscriptions() {
        let resolved = resolver(catalog(Some("price_free")), None, vec![])
            .resolve_plan(&UserId::new())
            .await
            .unwrap();

        assert_eq!(resolved.plan.code.as_str(), "free");
        assert!(!resolved.has_entitling_subscription);
        assert_eq!(resolved.source, PlanSource::FreeFallback);
    }

    #[tokio::test]
    async fn test_free_plan_fails_closed() {
        let result = resolver(catalog(None), None, vec![])
            .resolve_plan(&UserId::new())
            .await;
        assert!(matches!(result, Err(BillingError::Config(_))));
    }

    #[tokio::test]
    async fn test_most_recent_subscription_decides_plan() {
        let subs = vec![
            subscription("price_pro", datetime!(2024-01-01 0:00 UTC)),
            subscription("price_business", datetime!(2024-06-01 0:00 UTC)),
        ];
        let resolved = resolver(catalog(Some("price_free")), None, subs)
            .resolve_plan(&UserId::new())
            .await
            .unwrap();

        assert_eq!(resolved.plan.code.as_str(), "business");
        assert!(resolved.has_entitling_subscription);
        assert_eq!(resolved.source, PlanSource::Subscription);
    }

    #[tokio::test]
    async fn test_assignment_wins_over_subscription() {
        let assigned = Plan {
            code: code("pro"),
            price_id: "price_pro".into(),
            monthly_limit: Quota::Limited(200),
        };
        let subs = vec![subscription("price_business", datetime!(2024-06-01 0:00 UTC))];
        let resolved = resolver(catalog(Some("price_free")), Some(assigned), subs)
            .resolve_plan(&UserId::new())
            .await
            .unwrap();

        assert_eq!(resolved.plan.code.as_str(), "pro");
        assert_eq!(resolved.source, PlanSource::Assignment);
        assert!(resolved.has_entitling_subscription);
    }

    #[tokio::test]
    async fn test_unknown_price_falls_back_to_free() {
        let subs = vec![subscription("price_legacy", datetime!(2024-06-01 0:00 UTC))];
        let resolved = resolver(catalog(Some("price_free")), None, subs)
            .resolve_plan(&UserId::new())
            .await
            .unwrap();

        assert_eq!(resolved.plan.code.as_str(), "free");
        assert!(!resolved.has_entitling_subscription);
    }

    #[tokio::test]
    async fn test_period_from_subscription() {
        let mut sub = subscription("price_pro", datetime!(2024-01-01 0:00 UTC));
        sub.current_period_start = Some(datetime!(2024-06-10 0:00 UTC));
        sub.current_period_end = Some(datetime!(2024-07-10 0:00 UTC));

        let period = resolver(catalog(Some("price_free")), None, vec![sub])
            .resolve_billing_period_at(&UserId::new(), datetime!(2024-06-20 0:00 UTC))
            .await
            .unwrap();

        assert_eq!(period.start, datetime!(2024-06-10 0:00 UTC));
        assert_eq!(period.end, datetime!(2024-07-10 0:00 UTC));
        assert_eq!(period.source, PeriodSource::Subscription);
    }

    #[tokio::test]
    async fn test_period_falls_back_on_invalid_bounds() {
        let mut sub = subscription("price_pro", datetime!(2024-01-01 0:00 UTC));
        sub.current_period_start = Some(datetime!(2024-07-10 0:00 UTC));
        sub.current_period_end = Some(datetime!(2024-06-10 0:00 UTC));

        let period = resolver(catalog(Some("price_free")), None, vec![sub])
            .resolve_billing_period_at(&UserId::new(), datetime!(2024-06-20 0:00 UTC))
            .await
            .unwrap();

        assert_eq!(period.start, datetime!(2024-06-01 0:00 UTC));
        assert_eq!(period.end, datetime!(2024-07-01 0:00 UTC));
        assert_eq!(period.source, PeriodSource::CalendarMonth);
    }

    #[tokio::test]
    async fn test_assignment_keeps_subscription_period() {
        let assigned = Plan {
            code: code("pro"),
            price_id: "price_pro".into(),
            monthly_limit: Quota::Limited(200),
        };
        let mut sub = subscription("price_business", datetime!(2024-01-01 0:00 UTC));
        sub.current_period_start = Some(datetime!(2024-06-10 0:00 UTC));
        sub.current_period_end = Some(datetime!(2024-07-10 0:00 UTC));

        let resolution = resolver(catalog(Some("price_free")), Some(assigned), vec![sub])
            .resolve_at(&UserId::new(), datetime!(2024-06-20 0:00 UTC))
            .await
            .unwrap();

        assert_eq!(resolution.plan.source, PlanSource::Assignment);
        assert_eq!(resolution.period.source, PeriodSource::Subscription);
        assert_eq!(resolution.period.start, datetime!(2024-06-10 0:00 UTC));
    }

    #[tokio::test]
    async fn test_store_errors_propagate() {
        let mut plans = MockPlanRepository::new();
        plans
            .expect_find_assigned_plan()
            .returning(|_| Err(BillingError::Database("connection reset".into())));
        let subscriptions = MockSubscriptionRepository::new();
        let resolver = UsagePeriodResolver::new(
            catalog(Some("price_free")),
            Arc::new(plans),
            Arc::new(subscriptions),
        );

        let err = resolver.resolve_plan(&UserId::new()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
