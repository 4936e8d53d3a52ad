//! Common types used across pixquota

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ValidationError;

// =============================================================================
// ID Wrappers
// =============================================================================

/// User ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a user id supplied by a caller. Surrounding whitespace is ignored.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyUserId);
        }
        Uuid::parse_str(trimmed)
            .map(Self)
            .map_err(|_| ValidationError::MalformedUserId(trimmed.to_string()))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for UserId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Maximum length of a plan code
pub const PLAN_CODE_MAX_LEN: usize = 64;

/// Plan code (`free`, `pro`, `business`, ...)
///
/// Lowercase ASCII, starts with a letter, then letters, digits, `_` or `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PlanCode(String);

impl PlanCode {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let code = raw.trim().to_lowercase();
        if code.is_empty() {
            return Err(ValidationError::EmptyPlanCode);
        }

        let mut chars = code.chars();
        let starts_with_letter = chars.next().is_some_and(|c| c.is_ascii_lowercase());
        let rest_valid =
            chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');

        if !starts_with_letter || !rest_valid || code.len() > PLAN_CODE_MAX_LEN {
            return Err(ValidationError::MalformedPlanCode(raw.trim().to_string()));
        }

        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PlanCode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for PlanCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for PlanCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PlanCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Subscription status as reported by the payment processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    IncompleteExpired,
    Trialing,
    Active,
    PastDue,
    Canceled,
    Unpaid,
    Paused,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::Trialing => "trialing",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Unpaid => "unpaid",
            Self::Paused => "paused",
        }
    }

    /// Only `active` and `trialing` subscriptions entitle a user to their plan
    pub fn is_entitling(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incomplete" => Ok(Self::Incomplete),
            "incomplete_expired" => Ok(Self::IncompleteExpired),
            "trialing" => Ok(Self::Trialing),
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            "canceled" => Ok(Self::Canceled),
            "unpaid" => Ok(Self::Unpaid),
            "paused" => Ok(Self::Paused),
            other => Err(ValidationError::UnknownStatus(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_parse() {
        let id = Uuid::new_v4();
        assert_eq!(UserId::parse(&id.to_string()).unwrap(), UserId(id));
        assert_eq!(UserId::parse(&format!("  {id} ")).unwrap(), UserId(id));
    }

    #[test]
    fn test_user_id_rejects_empty_and_malformed() {
        assert_eq!(UserId::parse(""), Err(ValidationError::EmptyUserId));
        assert_eq!(UserId::parse("   "), Err(ValidationError::EmptyUserId));
        assert!(matches!(
            UserId::parse("not-a-uuid"),
            Err(ValidationError::MalformedUserId(_))
        ));
    }

    #[test]
    fn test_plan_code_parse() {
        assert_eq!(PlanCode::parse("pro").unwrap().as_str(), "pro");
        assert_eq!(PlanCode::parse(" Business ").unwrap().as_str(), "business");
        assert_eq!(PlanCode::parse("team_2024").unwrap().as_str(), "team_2024");
    }

    #[test]
    fn test_plan_code_rejects_bad_input() {
        assert_eq!(PlanCode::parse(""), Err(ValidationError::EmptyPlanCode));
        assert!(PlanCode::parse("1pro").is_err());
        assert!(PlanCode::parse("pro plan").is_err());
        assert!(PlanCode::parse(&"a".repeat(PLAN_CODE_MAX_LEN + 1)).is_err());
    }

    #[test]
    fn test_plan_code_deserialize_validates() {
        let code: PlanCode = serde_json::from_str("\"pro\"").unwrap();
        assert_eq!(code.as_str(), "pro");
        assert!(serde_json::from_str::<PlanCode>("\"\"").is_err());
    }

    #[test]
    fn test_subscription_status_roundtrip() {
        for status in [
            SubscriptionStatus::Incomplete,
            SubscriptionStatus::IncompleteExpired,
            SubscriptionStatus::Trialing,
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Unpaid,
            SubscriptionStatus::Paused,
        ] {
            assert_eq!(status.as_str().parse::<SubscriptionStatus>().unwrap(), status);
        }
        assert!("expired".parse::<SubscriptionStatus>().is_err());
    }

    #[test]
    fn test_entitling_statuses() {
        assert!(SubscriptionStatus::Active.is_entitling());
        assert!(SubscriptionStatus::Trialing.is_entitling());
        assert!(!SubscriptionStatus::PastDue.is_entitling());
        assert!(!SubscriptionStatus::Canceled.is_entitling());
        assert!(!SubscriptionStatus::Incomplete.is_entitling());
        assert!(!SubscriptionStatus::Paused.is_entitling());
    }
}
