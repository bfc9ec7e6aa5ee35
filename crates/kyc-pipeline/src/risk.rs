use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kyc_core::{RiskAssessment, RiskLevel, SubmissionDraft};
use serde::Deserialize;

use crate::error::PipelineError;
use crate::llm::{LlmClient, LlmRequest, extract_json};

const RISK_MAX_TOKENS: u32 = 300;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RiskResponse {
    #[serde(default)]
    risk_level: Option<RiskLevel>,
    #[serde(default)]
    details: Option<String>,
}

/// LLM-backed compliance risk assessment.
///
/// Optional enrichment: any failure yields no assessment rather than an error.
pub struct RiskAssessor {
    llm: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl RiskAssessor {
    pub fn new(llm: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    pub async fn assess(&self, draft: &SubmissionDraft) -> Option<RiskAssessment> {
        match tokio::time::timeout(self.timeout, self.try_assess(draft)).await {
            Ok(Ok(assessment)) => Some(assessment),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Risk assessment failed");
                None
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "Risk assessment timed out");
                None
            }
        }
    }

    async fn try_assess(&self, draft: &SubmissionDraft) -> Result<RiskAssessment, PipelineError> {
        let request = LlmRequest::prompt(risk_prompt(draft), RISK_MAX_TOKENS);
        let response = self.llm.chat(&request).await?;

        let parsed: RiskResponse = extract_json(&response.content).ok_or_else(|| {
            let preview: String = response.content.chars().take(200).collect();
            PipelineError::DependencyUnavailable(format!(
                "risk assessment was not JSON: {preview}"
            ))
        })?;

        Ok(RiskAssessment {
            level: parsed.risk_level.unwrap_or(RiskLevel::Medium),
            details: parsed
                .details
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| "Unable to assess risk".into()),
            assessed_at: Utc::now(),
        })
    }
}

fn risk_prompt(draft: &SubmissionDraft) -> String {
    let additional = if draft.additional_info.is_empty() {
        "None provided"
    } else {
        &draft.additional_info
    };
    format!(
        "You are a KYC compliance risk assessor. Analyze the following submission and provide a risk assessment.

Full Name: {}
Address: {}, {}, {}
ID Type: {}
Additional Information: {}

Respond in this exact JSON format:
{{
  \"riskLevel\": \"low|medium|high\",
  \"details\": \"Brief assessment of compliance risk\"
}}",
        draft.full_name, draft.address, draft.city, draft.country, draft.id_type, additional,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{StubLlmClient, UnavailableLlmClient};
    use crate::test_support::jane_doe;

    fn assessor(llm: Arc<dyn LlmClient>) -> RiskAssessor {
        RiskAssessor::new(llm, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn parses_fenced_json() {
        let llm = Arc::new(StubLlmClient::constant(
            "```json\n{\"riskLevel\": \"low\", \"details\": \"Standard profile\"}\n```",
        ));
        let assessment = assessor(llm).assess(&jane_doe()).await.unwrap();
        assert_eq!(assessment.level, RiskLevel::Low);
        assert_eq!(assessment.details, "Standard profile");
    }

    #[tokio::test]
    async fn missing_fields_get_defaults() {
        let llm = Arc::new(StubLlmClient::constant("{}"));
        let assessment = assessor(llm).assess(&jane_doe()).await.unwrap();
        assert_eq!(assessment.level, RiskLevel::Medium);
        assert_eq!(assessment.details, "Unable to assess risk");
    }

    #[tokio::test]
    async fn prose_response_yields_none() {
        let llm = Arc::new(StubLlmClient::constant("This applicant looks fine."));
        assert!(assessor(llm).assess(&jane_doe()).await.is_none());
    }

    #[tokio::test]
    async fn provider_failure_yields_none() {
        assert!(assessor(Arc::new(UnavailableLlmClient)).assess(&jane_doe()).await.is_none());
    }
}
