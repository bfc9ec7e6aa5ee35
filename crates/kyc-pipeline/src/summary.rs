//! Compliance summary generation.
//!
//! Three strategies in priority order: the LLM, an external summarization
//! service, and a deterministic local sentence that cannot fail.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use kyc_core::cascade::{Cascade, CascadeStep, FallbackStep, StepFuture};
use kyc_core::submission::age_on;
use kyc_core::{StepError, SubmissionDraft};
use serde::Deserialize;

use crate::config::KycConfig;
use crate::error::PipelineError;
use crate::llm::{LlmClient, complete};

pub type SummaryCascade = Cascade<SubmissionDraft, String>;

const SUMMARY_MAX_TOKENS: u32 = 300;
const ADDITIONAL_INFO_LIMIT: usize = 100;

/// Assemble the summary cascade from configuration.
///
/// The LLM step is included only when its flag is on and a credential is
/// present; the external step only when an endpoint is configured.
pub fn build_summary_cascade(
    config: &KycConfig,
    llm: Arc<dyn LlmClient>,
    has_credential: bool,
) -> Result<SummaryCascade, PipelineError> {
    let mut cascade = Cascade::new("summary", LocalSummary::today()).with_timeout(config.llm_timeout());

    if config.features.llm_summary && has_credential {
        cascade = cascade.with_step(LlmSummary::new(llm));
    }
    if let Some(summarizer) = &config.summarizer {
        cascade = cascade.with_step(ExternalSummary::new(
            summarizer.url.clone(),
            Duration::from_secs(summarizer.timeout_secs),
        )?);
    }
    Ok(cascade)
}

pub struct LlmSummary {
    llm: Arc<dyn LlmClient>,
}

impl LlmSummary {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

fn summary_prompt(draft: &SubmissionDraft) -> String {
    let additional = if draft.additional_info.is_empty() {
        "None provided"
    } else {
        &draft.additional_info
    };
    format!(
        "You are a professional KYC compliance officer. Generate a concise, professional summary (3-4 sentences) of the following Know Your Customer (KYC) submission:

Full Name: {}
Date of Birth: {}
Address: {}, {}, {} - {}
ID Type: {}
ID Number: {}
Additional Information: {}

The summary should be professional, objective, and highlight key compliance-relevant information.",
        draft.full_name,
        draft.date_of_birth,
        draft.address,
        draft.city,
        draft.country,
        draft.postal_code,
        draft.id_type,
        draft.id_number,
        additional,
    )
}

impl CascadeStep<SubmissionDraft, String> for LlmSummary {
    fn name(&self) -> &str {
        "llm"
    }

    fn attempt<'a>(&'a self, input: &'a SubmissionDraft) -> StepFuture<'a, String> {
        Box::pin(async move {
            let text = complete(self.llm.as_ref(), summary_prompt(input), SUMMARY_MAX_TOKENS)
                .await?;
            Ok(text)
        })
    }
}

/// POSTs a plain-text description to a summarization service.
pub struct ExternalSummary {
    http: reqwest::Client,
    url: String,
}

#[derive(Debug, Deserialize)]
struct SummarizerResponse {
    #[serde(default)]
    summary: Option<String>,
}

impl ExternalSummary {
    pub fn new(url: String, timeout: Duration) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self { http, url })
    }
}

impl CascadeStep<SubmissionDraft, String> for ExternalSummary {
    fn name(&self) -> &str {
        "external"
    }

    fn attempt<'a>(&'a self, input: &'a SubmissionDraft) -> StepFuture<'a, String> {
        Box::pin(async move {
            let body = serde_json::json!({ "text": input.describe() });
            let resp = self
                .http
                .post(&self.url)
                .json(&body)
                .send()
                .await
                .map_err(|e| StepError::DependencyUnavailable(format!("summarizer: {e}")))?;

            if !resp.status().is_success() {
                return Err(StepError::DependencyUnavailable(format!(
                    "summarizer returned {}",
                    resp.status()
                )));
            }

            let parsed: SummarizerResponse = resp.json().await.map_err(|e| {
                StepError::DependencyUnavailable(format!("summarizer response: {e}"))
            })?;

            parsed
                .summary
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    StepError::DependencyUnavailable("summarizer response has no summary".into())
                })
        })
    }
}

/// Deterministic summary sentence. Always available.
pub struct LocalSummary {
    /// Pinned reference date; `None` means "today" at call time.
    today: Option<NaiveDate>,
}

impl LocalSummary {
    pub fn today() -> Self {
        Self { today: None }
    }

    pub fn as_of(date: NaiveDate) -> Self {
        Self { today: Some(date) }
    }
}

impl FallbackStep<SubmissionDraft, String> for LocalSummary {
    fn name(&self) -> &str {
        "local"
    }

    fn produce(&self, input: &SubmissionDraft) -> String {
        let today = self.today.unwrap_or_else(|| Utc::now().date_naive());
        local_summary(input, today)
    }
}

pub fn local_summary(draft: &SubmissionDraft, today: NaiveDate) -> String {
    let age = match draft.birth_date() {
        Ok(birth) => format!("{} years old", age_on(birth, today)),
        Err(_) => "of unknown age".to_string(),
    };

    let mut summary = format!(
        "KYC verification for {}, {}, residing in {}, {}. Identity verified using {} ({}). Address: {}, {}.",
        draft.full_name,
        age,
        draft.city,
        draft.country,
        draft.formatted_id_type(),
        draft.id_number,
        draft.address,
        draft.postal_code,
    );

    if !draft.additional_info.is_empty() {
        let notes: String = draft
            .additional_info
            .chars()
            .take(ADDITIONAL_INFO_LIMIT)
            .collect();
        summary.push_str(" Additional notes: ");
        summary.push_str(&notes);
    }

    summary
}
