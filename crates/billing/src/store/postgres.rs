//! PostgreSQL store

use async_trait::async_trait;
use pixquota_shared::{PlanCode, SubscriptionStatus, UserId};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    CommitOutcome, CustomerLink, EventEffect, EventLedger, PlanRepository, ProcessedEvent,
    SubscriptionRepository, UpsertOutcome, UsageRepository,
};
use crate::catalog::{Plan, Quota};
use crate::error::{BillingError, BillingResult};
use crate::subscription::{OrderingPolicy, SubscriptionChange, SubscriptionRecord};

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, user_id, external_subscription_id, external_customer_id, status, price_id,
    current_period_start, current_period_end, cancel_at, canceled_at, cancel_at_period_end,
    created_at, updated_at, last_event_at
"#;

#[derive(sqlx::FromRow)]
struct PlanRow {
    code: String,
    price_id: String,
    monthly_limit: Option<i64>,
}

impl TryFrom<PlanRow> for Plan {
    type Error = BillingError;

    fn try_from(row: PlanRow) -> BillingResult<Self> {
        Ok(Plan {
            code: PlanCode::parse(&row.code)
                .map_err(|e| BillingError::Database(format!("plans.code: {}", e)))?,
            price_id: row.price_id,
            monthly_limit: Quota::from_column(row.monthly_limit)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    external_subscription_id: String,
    external_customer_id: Option<String>,
    status: String,
    price_id: Option<String>,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    cancel_at: Option<OffsetDateTime>,
    canceled_at: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    created_at: Option<OffsetDateTime>,
    updated_at: OffsetDateTime,
    last_event_at: Option<OffsetDateTime>,
}

impl TryFrom<SubscriptionRow> for SubscriptionRecord {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> BillingResult<Self> {
        let status = row
            .status
            .parse::<SubscriptionStatus>()
            .map_err(|e| BillingError::Database(format!("subscriptions.status: {}", e)))?;

        Ok(SubscriptionRecord {
            id: row.id,
            user_id: UserId(row.user_id),
            external_subscription_id: row.external_subscription_id,
            external_customer_id: row.external_customer_id,
            status,
            price_id: row.price_id,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at: row.cancel_at,
            canceled_at: row.canceled_at,
            cancel_at_period_end: row.cancel_at_period_end,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_event_at: row.last_event_at,
        })
    }
}

fn into_records(rows: Vec<SubscriptionRow>) -> BillingResult<Vec<SubscriptionRecord>> {
    rows.into_iter().map(SubscriptionRecord::try_from).collect()
}

/// Billing store backed by the application database
#[derive(Debug, Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Upsert keyed by external id. Returns `None` when the ordering guard skipped the update.
    async fn upsert_subscription(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        change: &SubscriptionChange,
        ordering: OrderingPolicy,
    ) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO subscriptions (
                id, user_id, external_subscription_id, external_customer_id, status, price_id,
                current_period_start, current_period_end, cancel_at, canceled_at,
                cancel_at_period_end, created_at, updated_at, last_event_at
            ) VALUES (
                $1, $2, $3, $4, COALESCE($5::text, 'incomplete'), $6,
                $7, $8, $9, $10,
                COALESCE($11::boolean, FALSE), $12, NOW(), $13
            )
            ON CONFLICT (external_subscription_id) DO UPDATE SET
                external_customer_id = COALESCE($4, subscriptions.external_customer_id),
                status = COALESCE($5::text, subscriptions.status),
                price_id = COALESCE($6, subscriptions.price_id),
                current_period_start = COALESCE($7, subscriptions.current_period_start),
                current_period_end = COALESCE($8, subscriptions.current_period_end),
                cancel_at = CASE WHEN $14 THEN $9 ELSE subscriptions.cancel_at END,
                canceled_at = CASE WHEN $15 THEN $10 ELSE subscriptions.canceled_at END,
                cancel_at_period_end = COALESCE($11::boolean, subscriptions.cancel_at_period_end),
                created_at = COALESCE($12, subscriptions.created_at),
                updated_at = NOW(),
                last_event_at = GREATEST(subscriptions.last_event_at, $13)
            WHERE $16
               OR subscriptions.last_event_at IS NULL
               OR subscriptions.last_event_at <= $13
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(change.user_id.as_uuid())
        .bind(&change.external_subscription_id)
        .bind(change.external_customer_id.as_deref())
        .bind(change.status.map(|s| s.as_str()))
        .bind(change.price_id.as_deref())
        .bind(change.current_period_start)
        .bind(change.current_period_end)
        .bind(change.cancel_at.flatten())
        .bind(change.canceled_at.flatten())
        .bind(change.cancel_at_period_end)
        .bind(change.created_at)
        .bind(change.event_at)
        .bind(change.cancel_at.is_some())
        .bind(change.canceled_at.is_some())
        .bind(ordering == OrderingPolicy::Arrival)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(row.map(|(id,)| id))
    }

    async fn link_customer(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        link: &CustomerLink,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_customers (external_customer_id, user_id)
            VALUES ($1, $2)
            ON CONFLICT (external_customer_id) DO NOTHING
            "#,
        )
        .bind(&link.external_customer_id)
        .bind(link.user_id.as_uuid())
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl PlanRepository for PgBillingStore {
    async fn find_plan(&self, code: &PlanCode) -> BillingResult<Option<Plan>> {
        let row: Option<PlanRow> =
            sqlx::query_as("SELECT code, price_id, monthly_limit FROM plans WHERE code = $1")
                .bind(code.as_str())
                .fetch_optional(&self.pool)
                .await?;

        row.map(Plan::try_from).transpose()
    }

    async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        let rows: Vec<PlanRow> =
            sqlx::query_as("SELECT code, price_id, monthly_limit FROM plans ORDER BY code")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(Plan::try_from).collect()
    }

    async fn upsert_plan(&self, plan: &Plan) -> BillingResult<UpsertOutcome> {
        // xmax is zero only on a freshly inserted tuple
        let inserted: Option<bool> = sqlx::query_scalar(
            r#"
            INSERT INTO plans (code, price_id, monthly_limit)
            VALUES ($1, $2, $3)
            ON CONFLICT (code) DO UPDATE SET
                price_id = EXCLUDED.price_id,
                monthly_limit = EXCLUDED.monthly_limit,
                updated_at = NOW()
            WHERE plans.price_id IS DISTINCT FROM EXCLUDED.price_id
               OR plans.monthly_limit IS DISTINCT FROM EXCLUDED.monthly_limit
            RETURNING (xmax = 0)
            "#,
        )
        .bind(plan.code.as_str())
        .bind(&plan.price_id)
        .bind(plan.monthly_limit.to_column()?)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match inserted {
            Some(true) => UpsertOutcome::Created,
            Some(false) => UpsertOutcome::Updated,
            None => UpsertOutcome::Unchanged,
        })
    }

    async fn find_assigned_plan(&self, user_id: &UserId) -> BillingResult<Option<Plan>> {
        let row: Option<PlanRow> = sqlx::query_as(
            r#"
            SELECT p.code, p.price_id, p.monthly_limit
            FROM plan_assignments a
            JOIN plans p ON p.code = a.plan_code
            WHERE a.user_id = $1
            "#,
        )
        .bind(user_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Plan::try_from).transpose()
    }

    async fn assign_plan(&self, user_id: &UserId, code: &PlanCode) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO plan_assignments (user_id, plan_code)
            SELECT $1, code FROM plans WHERE code = $2
            ON CONFLICT (user_id) DO UPDATE SET
                plan_code = EXCLUDED.plan_code,
                granted_at = NOW()
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(code.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("plan '{}'", code)));
        }
        Ok(())
    }

    async fn revoke_plan(&self, user_id: &UserId) -> BillingResult<bool> {
        let result = sqlx::query("DELETE FROM plan_assignments WHERE user_id = $1")
            .bind(user_id.as_uuid())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl SubscriptionRepository for PgBillingStore {
    async fn list_entitling_for_user(&self, user_id: &UserId) -> BillingResult<Vec<SubscriptionRecord>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1 AND status IN ('active', 'trialing')",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        into_records(rows)
    }

    async fn list_entitling(&self) -> BillingResult<Vec<SubscriptionRecord>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE status IN ('active', 'trialing') \
             ORDER BY external_subscription_id",
            SUBSCRIPTION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        into_records(rows)
    }

    async fn find_by_external_id(&self, external_subscription_id: &str) -> BillingResult<Option<SubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE external_subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(external_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubscriptionRecord::try_from).transpose()
    }

    async fn find_user_for_customer(&self, external_customer_id: &str) -> BillingResult<Option<UserId>> {
        let user_id: Option<Uuid> = sqlx::query_scalar(
            "SELECT user_id FROM billing_customers WHERE external_customer_id = $1",
        )
        .bind(external_customer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user_id.map(UserId))
    }
}

#[async_trait]
impl EventLedger for PgBillingStore {
    async fn is_processed(&self, event_id: &str) -> BillingResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM processed_events WHERE event_id = $1)",
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn commit(
        &self,
        event: &ProcessedEvent,
        effect: &EventEffect,
        ordering: OrderingPolicy,
    ) -> BillingResult<CommitOutcome> {
        let mut tx = self.pool.begin().await?;

        // Claim the event id first. A concurrent delivery of the same event blocks here until
        // the winner commits, then sees the conflict.
        let claimed: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO processed_events (event_id, event_type, event_created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING event_id
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(event.event_created_at)
        .fetch_optional(&mut *tx)
        .await?;

        if claimed.is_none() {
            tx.rollback().await?;
            return Ok(CommitOutcome::Duplicate);
        }

        let outcome = match effect {
            EventEffect::None => CommitOutcome::Recorded,
            EventEffect::Customer(link) => {
                Self::link_customer(&mut tx, link).await?;
                CommitOutcome::Recorded
            }
            EventEffect::Subscription(change) => {
                match Self::upsert_subscription(&mut tx, change, ordering).await? {
                    Some(_) => CommitOutcome::Recorded,
                    None => CommitOutcome::Stale,
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn prune_processed_before(&self, cutoff: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query("DELETE FROM processed_events WHERE processed_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl UsageRepository for PgBillingStore {
    async fn count_images(
        &self,
        user_id: &UserId,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BillingResult<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM images
            WHERE user_id = $1
              AND created_at >= $2
              AND created_at < $3
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }
}
