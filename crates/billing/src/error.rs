//! Billing error types

use pixquota_shared::ValidationError;
use thiserror::Error;

use crate::reconciler::PriceMismatch;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(
        "Catalog drift: {} entitling subscription(s) reference price ids missing from the plan catalog",
        .0.len()
    )]
    CatalogDrift(Vec<PriceMismatch>),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Unable to determine usage")]
    UsageUnavailable,
}

/// Coarse error taxonomy exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller bug; never retried
    InvalidInput,
    /// Deployment defect; surfaced to operators
    Configuration,
    /// Expected absence
    NotFound,
    /// Persistence failure; safe to retry
    TransientStore,
    /// Inbound webhook failed authentication
    Unauthenticated,
    /// Sanitized request-path failure, details are only in the log
    Unavailable,
}

impl BillingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::InvalidInput(_) => ErrorKind::InvalidInput,
            BillingError::Config(_) | BillingError::CatalogDrift(_) => ErrorKind::Configuration,
            BillingError::NotFound(_) => ErrorKind::NotFound,
            BillingError::Database(_) => ErrorKind::TransientStore,
            BillingError::WebhookSignatureInvalid => ErrorKind::Unauthenticated,
            BillingError::UsageUnavailable => ErrorKind::Unavailable,
        }
    }

    /// Whether retrying the same operation later can succeed
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientStore
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<ValidationError> for BillingError {
    fn from(err: ValidationError) -> Self {
        BillingError::InvalidInput(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            BillingError::InvalidInput("x".into()).kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(BillingError::Config("x".into()).kind(), ErrorKind::Configuration);
        assert_eq!(BillingError::CatalogDrift(vec![]).kind(), ErrorKind::Configuration);
        assert_eq!(BillingError::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(BillingError::Database("x".into()).kind(), ErrorKind::TransientStore);
    }

    #[test]
    fn test_only_store_errors_are_retryable() {
        assert!(BillingError::Database("timeout".into()).is_retryable());
        assert!(!BillingError::InvalidInput("bad".into()).is_retryable());
        assert!(!BillingError::Config("missing".into()).is_retryable());
        assert!(!BillingError::UsageUnavailable.is_retryable());
    }

    #[test]
    fn test_validation_error_maps_to_invalid_input() {
        let err: BillingError = ValidationError::EmptyUserId.into();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(err.to_string(), "Invalid input: user id is empty");
    }

    #[test]
    fn test_usage_unavailable_hides_details() {
        assert_eq!(
            BillingError::UsageUnavailable.to_string(),
            "Unable to determine usage"
        );
    }
}
