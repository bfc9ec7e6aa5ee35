use std::sync::Arc;

use kyc_core::{EnrichmentResult, KycRecord, SubmissionDraft};
use uuid::Uuid;

use crate::config::{KycConfig, LlmHandle};
use crate::error::PipelineError;
use crate::metrics::PipelineMetrics;
use crate::queue::{HandlerFuture, MessageHandler, QueueMessage};
use crate::risk::RiskAssessor;
use crate::store::RecordStore;
use crate::summary::{SummaryCascade, build_summary_cascade};
use crate::translation::Translator;

/// Turns queued submissions into pending KYC records.
///
/// Enrichment never fails: the summary cascade always yields text and the
/// optional steps degrade to nothing. Only a store failure rejects a message.
pub struct IntakeWorker {
    summary: SummaryCascade,
    risk: Option<RiskAssessor>,
    translator: Arc<Translator>,
    store: Arc<dyn RecordStore>,
    metrics: Arc<PipelineMetrics>,
}

impl IntakeWorker {
    pub fn new(
        summary: SummaryCascade,
        translator: Arc<Translator>,
        store: Arc<dyn RecordStore>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            summary,
            risk: None,
            translator,
            store,
            metrics,
        }
    }

    pub fn with_risk_assessor(mut self, risk: RiskAssessor) -> Self {
        self.risk = Some(risk);
        self
    }

    /// Wire up every enrichment step the configuration enables.
    pub fn from_config(
        config: &KycConfig,
        llm: &LlmHandle,
        translator: Arc<Translator>,
        store: Arc<dyn RecordStore>,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self, PipelineError> {
        let summary = build_summary_cascade(config, Arc::clone(&llm.client), llm.has_credential)?;
        let worker = Self::new(summary, translator, store, metrics);
        if config.features.llm_risk_assessment && llm.has_credential {
            Ok(worker.with_risk_assessor(RiskAssessor::new(
                Arc::clone(&llm.client),
                config.llm_timeout(),
            )))
        } else {
            Ok(worker)
        }
    }

    pub async fn enrich(&self, draft: &SubmissionDraft) -> EnrichmentResult {
        let (summary, risk_assessment) = tokio::join!(self.summary.run(draft), async {
            match &self.risk {
                Some(risk) => risk.assess(draft).await,
                None => None,
            }
        });
        self.metrics.record_summary(&summary.step);
        if risk_assessment.is_some() {
            self.metrics.record_risk_assessment();
        }

        let mut enrichment = EnrichmentResult::new(summary.into_value());
        enrichment.risk_assessment = risk_assessment;

        if self.translator.is_enabled()
            && let Some(language) = draft.translation_target()
        {
            enrichment.summary_translations = self
                .translator
                .translate_many(&enrichment.summary, &[language])
                .await;
        }
        enrichment
    }

    /// Enrich and persist one message, returning the record id.
    ///
    /// A message that already produced a record is acknowledged without a
    /// second insert.
    pub async fn process(&self, message: &QueueMessage) -> Result<Uuid, PipelineError> {
        self.metrics.record_message_received();
        let draft = &message.submission;
        tracing::info!(
            message_id = %message.message_id,
            user_id = %message.user_id,
            id_fingerprint = %draft.id_fingerprint(),
            "Processing submission"
        );

        if let Some(existing) = self.store.find_by_message(message.message_id).await? {
            self.metrics.record_duplicate_delivery();
            tracing::info!(
                message_id = %message.message_id,
                record_id = %existing.id,
                "Submission already stored, skipping redelivery"
            );
            return Ok(existing.id);
        }

        let enrichment = self.enrich(draft).await;
        let record = KycRecord::pending(
            message.user_id.clone(),
            Some(message.message_id),
            draft.clone(),
            enrichment,
        );

        match self.store.insert(&record).await {
            Ok(id) => {
                self.metrics.record_record_created();
                tracing::info!(
                    message_id = %message.message_id,
                    record_id = %id,
                    "KYC record created"
                );
                Ok(id)
            }
            Err(e) => {
                self.metrics.record_submission_failed();
                tracing::error!(
                    message_id = %message.message_id,
                    user_id = %message.user_id,
                    error = %e,
                    "Failed to store KYC record; submission dropped"
                );
                Err(e)
            }
        }
    }
}

impl MessageHandler for IntakeWorker {
    fn handle<'a>(&'a self, message: &'a QueueMessage) -> HandlerFuture<'a> {
        Box::pin(async move { self.process(message).await.map(|_| ()) })
    }
}
