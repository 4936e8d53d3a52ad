#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! pixquota Worker
//!
//! Runs plan sync, catalog drift detection, and processed-event ledger pruning on a schedule.
//!
//! ## Usage
//! ```bash
//! # Scheduler (default)
//! pixquota-worker
//!
//! # One-shot maintenance, non-zero exit on failure or drift
//! pixquota-worker sync-plans
//! pixquota-worker validate-price-ids
//! pixquota-worker prune-ledger
//! ```
//!
//! ## Environment Variables
//! - DATABASE_URL: PostgreSQL connection string
//! - STRIPE_PRICE_FREE / STRIPE_PRICE_PRO / STRIPE_PRICE_BUSINESS: catalog price ids
//! - PLAN_SYNC_SCHEDULE, PRICE_CHECK_SCHEDULE, LEDGER_PRUNE_SCHEDULE: six-field cron expressions
//! - PROCESSED_EVENT_RETENTION_HOURS: ledger retention, at least 72
//! - LOG_FORMAT: `pretty` or `json`

mod config;
mod jobs;

use std::sync::Arc;

use anyhow::Context;
use pixquota_billing::BillingService;
use pixquota_shared::db::{create_pool, run_migrations};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, WorkerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Schedule,
    SyncPlans,
    ValidatePriceIds,
    PruneLedger,
}

impl Command {
    fn parse(arg: Option<&str>) -> anyhow::Result<Self> {
        match arg {
            None => Ok(Self::Schedule),
            Some("sync-plans") => Ok(Self::SyncPlans),
            Some("validate-price-ids") => Ok(Self::ValidatePriceIds),
            Some("prune-ledger") => Ok(Self::PruneLedger),
            Some(other) => anyhow::bail!(
                "unknown command '{}' (expected sync-plans, validate-price-ids or prune-ledger)",
                other
            ),
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "pixquota_billing=info,pixquota_worker=info,pixquota_shared=info".into());

    match format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let command = Command::parse(std::env::args().nth(1).as_deref())?;
    let config = WorkerConfig::from_env()?;
    init_tracing(config.log_format);

    let pool = create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("failed to connect to database")?;
    run_migrations(&pool)
        .await
        .context("failed to run migrations")?;

    let billing = Arc::new(BillingService::from_env(pool)?);

    match command {
        Command::SyncPlans => {
            jobs::sync_plans_at_startup(&billing).await?;
        }
        Command::ValidatePriceIds => {
            let checked = jobs::validate_price_ids(&billing).await?;
            info!(checked, "Price ids validated");
        }
        Command::PruneLedger => {
            let removed = jobs::prune_ledger(&billing, config.ledger_retention).await?;
            info!(removed, "Ledger pruned");
        }
        Command::Schedule => run_scheduler(billing, &config).await?,
    }

    Ok(())
}

async fn run_scheduler(billing: Arc<BillingService>, config: &WorkerConfig) -> anyhow::Result<()> {
    // Entitlement checks depend on synced plans, so a failed startup sync is fatal
    jobs::sync_plans_at_startup(&billing).await?;
    if jobs::validate_price_ids(&billing).await.is_err() {
        warn!("Starting with unresolved catalog drift");
    }

    let mut scheduler = JobScheduler::new().await?;

    let sync_billing = billing.clone();
    scheduler
        .add(Job::new_async(config.plan_sync_schedule.as_str(), move |_uuid, _lock| {
            let billing = sync_billing.clone();
            Box::pin(async move {
                let _ = jobs::sync_plans(&billing).await;
            })
        })?)
        .await?;

    let check_billing = billing.clone();
    scheduler
        .add(Job::new_async(config.price_check_schedule.as_str(), move |_uuid, _lock| {
            let billing = check_billing.clone();
            Box::pin(async move {
                let _ = jobs::validate_price_ids(&billing).await;
            })
        })?)
        .await?;

    let retention = config.ledger_retention;
    let prune_billing = billing;
    scheduler
        .add(Job::new_async(config.ledger_prune_schedule.as_str(), move |_uuid, _lock| {
            let billing = prune_billing.clone();
            Box::pin(async move {
                if let Ok(removed) = jobs::prune_ledger(&billing, retention).await {
                    info!(removed, "Ledger pruned");
                }
            })
        })?)
        .await?;

    scheduler.start().await?;
    info!(
        plan_sync = %config.plan_sync_schedule,
        price_check = %config.price_check_schedule,
        ledger_prune = %config.ledger_prune_schedule,
        "Worker scheduler started"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    if let Err(e) = scheduler.shutdown().await {
        error!(error = %e, "Scheduler shutdown failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_parse() {
        assert_eq!(Command::parse(None).unwrap(), Command::Schedule);
        assert_eq!(Command::parse(Some("sync-plans")).unwrap(), Command::SyncPlans);
        assert_eq!(
            Command::parse(Some("validate-price-ids")).unwrap(),
            Command::ValidatePriceIds
        );
        assert_eq!(Command::parse(Some("prune-ledger")).unwrap(), Command::PruneLedger);
        assert!(Command::parse(Some("migrate")).is_err());
    }
}
