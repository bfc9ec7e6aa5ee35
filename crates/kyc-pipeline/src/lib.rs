pub mod config;
pub mod error;
pub mod intake;
pub mod llm;
pub mod metrics;
pub mod queue;
pub mod rejection;
pub mod review;
pub mod risk;
pub mod store;
pub mod summary;
pub mod translation;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use config::{KycConfig, LlmHandle};
pub use error::PipelineError;
pub use intake::{Receipt, SubmissionIntake};
pub use metrics::{LoggingMetricsBackend, PipelineMetrics};
pub use queue::{MessageHandler, QueueMessage, WorkQueue};
pub use review::ReviewService;
pub use store::{FileRecordStore, RecordStore, StatusCounts};
pub use translation::{SUPPORTED_LANGUAGES, Translator};
pub use worker::IntakeWorker;
