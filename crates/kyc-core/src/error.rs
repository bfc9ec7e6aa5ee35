use std::time::Duration;

use thiserror::Error;

use crate::record::KycStatus;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{field} is required")]
    MissingField { field: &'static str },

    #[error("invalid date of birth '{value}': expected YYYY-MM-DD")]
    InvalidDate { value: String },

    #[error("cannot move record from {from} to {to}")]
    InvalidTransition { from: KycStatus, to: KycStatus },

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Failure of a single cascade step. Every variant means "try the next step".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("step timed out after {0:?}")]
    TimedOut(Duration),
}
