//! Error types for pixquota identifiers

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("user id is empty")]
    EmptyUserId,

    #[error("malformed user id: {0}")]
    MalformedUserId(String),

    #[error("plan code is empty")]
    EmptyPlanCode,

    #[error("malformed plan code: {0}")]
    MalformedPlanCode(String),

    #[error("unknown subscription status: {0}")]
    UnknownStatus(String),
}
