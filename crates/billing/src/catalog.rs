//! Plan Catalog
//!
//! The deploy-time list of plan codes, external price ids and monthly quotas.
//!
//! The catalog is the source of truth for plan definitions. The persisted `plans` table is a copy
//! kept in step by the reconciler, and subscriptions are matched to plans by price id against the
//! catalog.

use std::collections::HashSet;
use std::fmt;

use pixquota_shared::PlanCode;
use serde::{Serialize, Serializer};

use crate::error::{BillingError, BillingResult};

/// Code of the plan every user without an entitling subscription falls back to
pub const FREE_PLAN_CODE: &str = "free";

/// Largest limit the `plans.monthly_limit` BIGINT column holds
const MAX_LIMIT: u64 = i64::MAX as u64;

/// Monthly quota of a plan
///
/// `Limited(0)` is a real zero quota. Unlimited plans are spelled out explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quota {
    Limited(u64),
    Unlimited,
}

impl Quota {
    /// Parse `"unlimited"` or a non-negative integer
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("unlimited") {
            return Ok(Quota::Unlimited);
        }
        raw.parse::<u64>()
            .ok()
            .filter(|limit| *limit <= MAX_LIMIT)
            .map(Quota::Limited)
            .ok_or_else(|| {
                format!(
                    "invalid monthly limit '{}': expected an integer from 0 to {} or 'unlimited'",
                    raw, MAX_LIMIT
                )
            })
    }

    /// Quota left after `used` units. Never negative.
    pub fn remaining_after(&self, used: u64) -> Quota {
        match self {
            Quota::Limited(limit) => Quota::Limited(limit.saturating_sub(used)),
            Quota::Unlimited => Quota::Unlimited,
        }
    }

    /// Whether one more unit may be consumed after `used`
    pub fn admits(&self, used: u64) -> bool {
        match self {
            Quota::Limited(limit) => used < *limit,
            Quota::Unlimited => true,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, Quota::Unlimited)
    }

    /// Column representation: NULL is unlimited
    pub fn to_column(&self) -> BillingResult<Option<i64>> {
        match self {
            Quota::Limited(limit) => i64::try_from(*limit).map(Some).map_err(|_| {
                BillingError::InvalidInput(format!("monthly limit {} does not fit a column", limit))
            }),
            Quota::Unlimited => Ok(None),
        }
    }

    pub fn from_column(value: Option<i64>) -> BillingResult<Self> {
        match value {
            None => Ok(Quota::Unlimited),
            Some(limit) => u64::try_from(limit)
                .map(Quota::Limited)
                .map_err(|_| BillingError::Database(format!("negative monthly_limit {}", limit))),
        }
    }
}

impl fmt::Display for Quota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quota::Limited(limit) => write!(f, "{}", limit),
            Quota::Unlimited => write!(f, "unlimited"),
        }
    }
}

impl Serialize for Quota {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Quota::Limited(limit) => serializer.serialize_u64(*limit),
            Quota::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

/// A fully configured plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub code: PlanCode,
    pub price_id: String,
    pub monthly_limit: Quota,
}

/// One catalog line. The price id may be missing from the deployment's configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub code: PlanCode,
    pub price_id: Option<String>,
    pub monthly_limit: Quota,
}

impl CatalogEntry {
    pub fn new(code: PlanCode, price_id: Option<String>, monthly_limit: Quota) -> Self {
        let price_id = price_id
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
        Self {
            code,
            price_id,
            monthly_limit,
        }
    }

    /// The plan, if its price id is configured
    pub fn to_plan(&self) -> Option<Plan> {
        self.price_id.as_ref().map(|price_id| Plan {
            code: self.code.clone(),
            price_id: price_id.clone(),
            monthly_limit: self.monthly_limit,
        })
    }
}

/// Validated plan catalog
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    entries: Vec<CatalogEntry>,
}

impl PlanCatalog {
    /// Build a catalog. Codes and configured price ids must be unique and a free plan must exist.
    pub fn new(entries: Vec<CatalogEntry>) -> BillingResult<Self> {
        let mut codes = HashSet::new();
        let mut prices = HashSet::new();

        for entry in &entries {
            if !codes.insert(entry.code.as_str()) {
                return Err(BillingError::Config(format!(
                    "plan code '{}' appears more than once in the catalog",
                    entry.code
                )));
            }
            if let Some(price_id) = &entry.price_id {
                if !prices.insert(price_id.as_str()) {
                    return Err(BillingError::Config(format!(
                        "price id '{}' is mapped to more than one plan",
                        price_id
                    )));
                }
            }
        }

        if !codes.contains(FREE_PLAN_CODE) {
            return Err(BillingError::Config(
                "plan catalog has no 'free' plan".to_string(),
            ));
        }

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// The fallback plan. Fails closed when its price id is not configured.
    pub fn free_plan(&self) -> BillingResult<Plan> {
        self.entries
            .iter()
            .find(|e| e.code.as_str() == FREE_PLAN_CODE)
            .and_then(CatalogEntry::to_plan)
            .ok_or_else(|| {
                BillingError::Config("free plan price id is not configured".to_string())
            })
    }

    pub fn plan_for_price(&self, price_id: &str) -> Option<Plan> {
        self.entries
            .iter()
            .find(|e| e.price_id.as_deref() == Some(price_id))
            .and_then(CatalogEntry::to_plan)
    }

    pub fn entry_for_code(&self, code: &PlanCode) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| &e.code == code)
    }

    pub fn contains_price(&self, price_id: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.price_id.as_deref() == Some(price_id))
    }

    pub fn price_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|e| e.price_id.as_deref())
    }
}
