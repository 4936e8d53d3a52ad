//! Worker configuration

use std::env;

use thiserror::Error;
use time::Duration;

const DEFAULT_PLAN_SYNC_SCHEDULE: &str = "0 0 * * * *";
const DEFAULT_PRICE_CHECK_SCHEDULE: &str = "0 */15 * * * *";
const DEFAULT_LEDGER_PRUNE_SCHEDULE: &str = "0 30 3 * * *";
const DEFAULT_RETENTION_HOURS: i64 = 720;

/// Minimum ledger retention; the processor redelivers for up to three days
pub const MIN_RETENTION_HOURS: i64 = 72;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Worker process configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub plan_sync_schedule: String,
    pub price_check_schedule: String,
    pub ledger_prune_schedule: String,
    pub ledger_retention: Duration,
    pub log_format: LogFormat,
}

impl WorkerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_max_connections = match get("DATABASE_MAX_CONNECTIONS") {
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::Invalid("DATABASE_MAX_CONNECTIONS", raw))?,
            None => 5,
        };

        let retention_hours = match get("PROCESSED_EVENT_RETENTION_HOURS") {
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .ok()
                .filter(|h| *h >= MIN_RETENTION_HOURS)
                .ok_or(ConfigError::Invalid("PROCESSED_EVENT_RETENTION_HOURS", raw))?,
            None => DEFAULT_RETENTION_HOURS,
        };

        let log_format = match get("LOG_FORMAT").as_deref().map(str::trim) {
            None | Some("pretty") => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            Some(other) => return Err(ConfigError::Invalid("LOG_FORMAT", other.to_string())),
        };

        Ok(Self {
            database_url: get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections,
            plan_sync_schedule: get("PLAN_SYNC_SCHEDULE")
                .unwrap_or_else(|| DEFAULT_PLAN_SYNC_SCHEDULE.to_string()),
            price_check_schedule: get("PRICE_CHECK_SCHEDULE")
                .unwrap_or_else(|| DEFAULT_PRICE_CHECK_SCHEDULE.to_string()),
            ledger_prune_schedule: get("LEDGER_PRUNE_SCHEDULE")
                .unwrap_or_else(|| DEFAULT_LEDGER_PRUNE_SCHEDULE.to_string()),
            ledger_retention: Duration::hours(retention_hours),
            log_format,
        })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}
