pub mod cascade;
pub mod error;
pub mod record;
pub mod review;
pub mod submission;

pub use cascade::{Cascade, CascadeOutcome, CascadeStep, FallbackStep, StepFuture};
pub use error::{CoreError, StepError};
pub use record::{EnrichmentResult, KycRecord, KycStatus, RiskAssessment, RiskLevel};
pub use review::{RejectionCategory, RejectionRequest, TranslationRequest};
pub use submission::SubmissionDraft;
