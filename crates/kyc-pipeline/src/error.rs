use kyc_core::{CoreError, StepError};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("queue error: {0}")]
    QueueError(String),

    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("language '{language}' is not supported. Supported languages: {supported}")]
    UnsupportedLanguage { language: String, supported: String },

    #[error("validation error: {0}")]
    Validation(#[from] CoreError),

    #[error("user {user_id} already has a pending or approved KYC submission")]
    DuplicateActiveRecord { user_id: String },

    #[error("record store error: {0}")]
    Persistence(String),

    #[error("KYC record {0} not found")]
    NotFound(Uuid),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl From<PipelineError> for StepError {
    fn from(e: PipelineError) -> Self {
        StepError::DependencyUnavailable(e.to_string())
    }
}
