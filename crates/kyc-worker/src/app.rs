use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use kyc_pipeline::config::kyc_home;
use kyc_pipeline::{
    FileRecordStore, IntakeWorker, KycConfig, LlmHandle, LoggingMetricsBackend, PipelineMetrics,
    RecordStore, ReviewService, SubmissionIntake, Translator, WorkQueue,
};

/// Load configuration from `path`, else `~/.kyc/config.toml` if present,
/// else defaults. Environment overrides apply last.
pub fn load_config(path: Option<&Path>) -> Result<KycConfig> {
    let config = match path {
        Some(path) => KycConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            let default_path = kyc_home().join("config.toml");
            if default_path.exists() {
                KycConfig::from_file(&default_path)
                    .with_context(|| format!("loading config from {}", default_path.display()))?
            } else {
                KycConfig::default()
            }
        }
    };
    Ok(config.with_env_overrides())
}

/// Shared components, built once per command.
pub struct App {
    pub config: KycConfig,
    pub llm: LlmHandle,
    pub translator: Arc<Translator>,
    pub metrics: Arc<PipelineMetrics>,
}

impl App {
    pub fn new(config: KycConfig) -> Result<Self> {
        let llm = config.build_llm_client()?;
        let translator = Arc::new(Translator::new(
            &config,
            Arc::clone(&llm.client),
            llm.has_credential,
        ));
        tracing::debug!(
            provider = ?config.llm.provider,
            has_credential = llm.has_credential,
            translation_enabled = translator.is_enabled(),
            "LLM configured"
        );
        Ok(Self {
            config,
            llm,
            translator,
            metrics: Arc::new(PipelineMetrics::with_backend(Arc::new(LoggingMetricsBackend))),
        })
    }

    pub async fn store(&self) -> Result<Arc<dyn RecordStore>> {
        let store = FileRecordStore::new(self.config.store.dir.clone());
        store
            .init()
            .await
            .with_context(|| format!("opening record store at {}", self.config.store.dir.display()))?;
        Ok(Arc::new(store))
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::new(WorkQueue::with_metrics(
            self.config.queue.clone(),
            Arc::clone(&self.metrics),
        ))
    }

    pub async fn worker(&self) -> Result<IntakeWorker> {
        Ok(IntakeWorker::from_config(
            &self.config,
            &self.llm,
            Arc::clone(&self.translator),
            self.store().await?,
            Arc::clone(&self.metrics),
        )?)
    }

    pub async fn intake(&self, queue: Arc<WorkQueue>) -> Result<SubmissionIntake> {
        Ok(SubmissionIntake::new(queue, self.store().await?))
    }

    pub async fn review(&self) -> Result<ReviewService> {
        Ok(ReviewService::from_config(
            &self.config,
            &self.llm,
            Arc::clone(&self.translator),
            self.store().await?,
        ))
    }
}
