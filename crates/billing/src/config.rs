//! Billing configuration
//!
//! Built once at startup and handed to every component. Nothing reads the environment after
//! construction.

use std::time::Duration;

use pixquota_shared::PlanCode;

use crate::catalog::{CatalogEntry, PlanCatalog, Quota};
use crate::error::{BillingError, BillingResult};
use crate::signature::{SignatureVerifier, DEFAULT_TOLERANCE};
use crate::subscription::OrderingPolicy;

/// Built-in plans: code, price id variable, limit variable, default limit
const BUILTIN_PLANS: [(&str, &str, &str, Quota); 3] = [
    ("free", "STRIPE_PRICE_FREE", "PLAN_FREE_MONTHLY_LIMIT", Quota::Limited(0)),
    ("pro", "STRIPE_PRICE_PRO", "PLAN_PRO_MONTHLY_LIMIT", Quota::Limited(200)),
    (
        "business",
        "STRIPE_PRICE_BUSINESS",
        "PLAN_BUSINESS_MONTHLY_LIMIT",
        Quota::Limited(1000),
    ),
];

/// Configuration for the billing engine
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub catalog: PlanCatalog,
    /// Webhook signing secret. Signed application is refused without one.
    pub webhook_secret: Option<String>,
    pub signature_tolerance: Duration,
    pub ordering: OrderingPolicy,
}

impl BillingConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Create config from an arbitrary key lookup
    pub fn from_source<F>(lookup: F) -> BillingResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut entries = Vec::new();
        for (code, price_var, limit_var, default_limit) in BUILTIN_PLANS {
            let code = PlanCode::parse(code)?;
            let limit = match get(limit_var) {
                Some(raw) => Quota::parse(&raw)
                    .map_err(|e| BillingError::Config(format!("{}: {}", limit_var, e)))?,
                None => default_limit,
            };
            entries.push(CatalogEntry::new(code, get(price_var), limit));
        }

        if let Some(extra) = get("PLAN_CATALOG_EXTRA") {
            entries.extend(parse_extra_plans(&extra)?);
        }

        let signature_tolerance = match get("WEBHOOK_TOLERANCE_SECS") {
            Some(raw) => Duration::from_secs(raw.trim().parse().map_err(|_| {
                BillingError::Config(format!("WEBHOOK_TOLERANCE_SECS: invalid value '{}'", raw))
            })?),
            None => DEFAULT_TOLERANCE,
        };

        let ordering = match get("WEBHOOK_ORDERING") {
            Some(raw) => raw
                .parse()
                .map_err(|e| BillingError::Config(format!("WEBHOOK_ORDERING: {}", e)))?,
            None => OrderingPolicy::default(),
        };

        Ok(Self {
            catalog: PlanCatalog::new(entries)?,
            webhook_secret: get("STRIPE_WEBHOOK_SECRET"),
            signature_tolerance,
            ordering,
        })
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }

    pub fn with_ordering(mut self, ordering: OrderingPolicy) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn signature_verifier(&self) -> Option<SignatureVerifier> {
        self.webhook_secret
            .as_ref()
            .map(|secret| SignatureVerifier::new(secret.clone(), self.signature_tolerance))
    }
}

/// Parse `code=price_id:limit,...`
fn parse_extra_plans(raw: &str) -> BillingResult<Vec<CatalogEntry>> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| -> BillingResult<CatalogEntry> {
            let invalid = || {
                BillingError::Config(format!(
                    "PLAN_CATALOG_EXTRA: expected 'code=price_id:limit', got '{}'",
                    item
                ))
            };
            let (code, rest) = item.split_once('=').ok_or_else(invalid)?;
            let (price_id, limit) = rest.rsplit_once(':').ok_or_else(invalid)?;

            let code = PlanCode::parse(code)
                .map_err(|e| BillingError::Config(format!("PLAN_CATALOG_EXTRA: {}", e)))?;
            let limit = Quota::parse(limit)
                .map_err(|e| BillingError::Config(format!("PLAN_CATALOG_EXTRA: {}", e)))?;

            Ok(CatalogEntry::new(code, Some(price_id.to_string()), limit))
        })
        .collect()
}
