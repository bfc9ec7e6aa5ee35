use std::sync::Arc;

use kyc_core::{KycRecord, KycStatus, RejectionCategory, RejectionRequest};
use uuid::Uuid;

use crate::config::{KycConfig, LlmHandle};
use crate::error::PipelineError;
use crate::rejection::{RejectionCascade, build_rejection_cascade};
use crate::store::{RecordStore, StatusCounts, status_counts};
use crate::translation::{TranslatedReview, Translator};

/// Reviewer actions on stored records.
///
/// Rejection notices are generated and translated inline, not through the
/// queue.
pub struct ReviewService {
    store: Arc<dyn RecordStore>,
    rejection: RejectionCascade,
    translator: Arc<Translator>,
}

impl ReviewService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        rejection: RejectionCascade,
        translator: Arc<Translator>,
    ) -> Self {
        Self {
            store,
            rejection,
            translator,
        }
    }

    pub fn from_config(
        config: &KycConfig,
        llm: &LlmHandle,
        translator: Arc<Translator>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        let rejection =
            build_rejection_cascade(config, Arc::clone(&llm.client), llm.has_credential);
        Self::new(store, rejection, translator)
    }

    async fn load(&self, id: Uuid) -> Result<KycRecord, PipelineError> {
        self.store.get(id).await?.ok_or(PipelineError::NotFound(id))
    }

    pub async fn approve(&self, id: Uuid, reviewer: &str) -> Result<KycRecord, PipelineError> {
        let mut record = self.load(id).await?;
        record.approve(reviewer)?;
        self.store.update(&record, KycStatus::Pending).await?;
        tracing::info!(record_id = %id, reviewer, "KYC approved");
        Ok(record)
    }

    /// Reject a pending record with a generated notice.
    ///
    /// When the applicant prefers a language other than English the notice is
    /// also stored translated, keyed by lowercase language name.
    pub async fn reject(
        &self,
        id: Uuid,
        reviewer: &str,
        category: Option<RejectionCategory>,
        custom_text: Option<String>,
    ) -> Result<KycRecord, PipelineError> {
        let mut record = self.load(id).await?;
        if record.status != KycStatus::Pending {
            return Err(kyc_core::CoreError::InvalidTransition {
                from: record.status,
                to: KycStatus::Rejected,
            }
            .into());
        }

        let request = RejectionRequest::for_record(&record, category, custom_text);
        let outcome = self.rejection.run(&request).await;
        tracing::debug!(record_id = %id, step = %outcome.step, "Rejection notice generated");
        let reason = outcome.into_value();

        let translations = match record.submission.translation_target() {
            Some(language) if self.translator.is_enabled() => {
                self.translator.translate_many(&reason, &[language]).await
            }
            _ => Default::default(),
        };

        record.reject(reviewer, reason, translations)?;
        self.store.update(&record, KycStatus::Pending).await?;
        tracing::info!(
            record_id = %id,
            reviewer,
            category = %request.category(),
            "KYC rejected"
        );
        Ok(record)
    }

    /// Render a record's summary and rejection reason in `target_language`.
    pub async fn translate_record(
        &self,
        id: Uuid,
        target_language: &str,
    ) -> Result<TranslatedReview, PipelineError> {
        let record = self.load(id).await?;
        self.translator
            .translate_review(
                &record.summary,
                record.rejection_reason.as_deref(),
                target_language,
            )
            .await
    }

    /// Records in one status; pending newest-submitted first, reviewed
    /// newest-reviewed first.
    pub async fn list(&self, status: KycStatus) -> Result<Vec<KycRecord>, PipelineError> {
        let mut records = self.store.list(Some(status)).await?;
        if status != KycStatus::Pending {
            records.sort_by(|a, b| b.reviewed_at.cmp(&a.reviewed_at));
        }
        Ok(records)
    }

    pub async fn stats(&self) -> Result<StatusCounts, PipelineError> {
        status_counts(self.store.as_ref()).await
    }
}
