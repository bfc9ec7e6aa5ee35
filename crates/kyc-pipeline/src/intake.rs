use std::sync::Arc;

use kyc_core::SubmissionDraft;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::queue::{QueueMessage, WorkQueue};
use crate::store::RecordStore;

/// Accepted submission receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub message_id: Uuid,
    /// Whether the queue stored the message durably.
    pub accepted: bool,
}

/// Entry point for new submissions: validate, check for an active record,
/// enqueue.
///
/// The active-record check here only gives early feedback; the store
/// enforces the rule again when the worker inserts.
pub struct SubmissionIntake {
    queue: Arc<WorkQueue>,
    store: Arc<dyn RecordStore>,
}

impl SubmissionIntake {
    pub fn new(queue: Arc<WorkQueue>, store: Arc<dyn RecordStore>) -> Self {
        Self { queue, store }
    }

    pub async fn submit(
        &self,
        user_id: &str,
        draft: SubmissionDraft,
    ) -> Result<Receipt, PipelineError> {
        draft.validate()?;

        if self.store.find_active_for_user(user_id).await?.is_some() {
            return Err(PipelineError::DuplicateActiveRecord {
                user_id: user_id.to_string(),
            });
        }

        let message = QueueMessage::new(user_id, draft);
        let accepted = self.queue.enqueue(&message).await;
        tracing::info!(
            user_id,
            message_id = %message.message_id,
            accepted,
            "Submission received"
        );
        Ok(Receipt {
            message_id: message.message_id,
            accepted,
        })
    }
}
