use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// A message in an LLM conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

/// Request to an LLM.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system_prompt: Option<String>,
    pub messages: Vec<LlmMessage>,
    pub max_tokens: u32,
}

impl LlmRequest {
    /// A single-turn request carrying one user prompt.
    pub fn prompt(prompt: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            system_prompt: None,
            messages: vec![LlmMessage {
                role: "user".into(),
                content: prompt.into(),
            }],
            max_tokens,
        }
    }
}

/// Response from an LLM.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
}

/// Facade trait for LLM providers.
///
/// Implementations can call Anthropic, an OpenAI-compatible server, or return
/// deterministic responses for testing. Every failure is reported as
/// [`PipelineError::DependencyUnavailable`].
pub trait LlmClient: Send + Sync {
    fn chat<'a>(
        &'a self,
        request: &'a LlmRequest,
    ) -> Pin<Box<dyn Future<Output = Result<LlmResponse, PipelineError>> + Send + 'a>>;
}

/// Send a single prompt and return the trimmed completion.
///
/// An empty completion is treated as a malformed response.
pub async fn complete(
    llm: &dyn LlmClient,
    prompt: String,
    max_tokens: u32,
) -> Result<String, PipelineError> {
    let request = LlmRequest::prompt(prompt, max_tokens);
    let response = llm.chat(&request).await?;
    let text = response.content.trim();
    if text.is_empty() {
        return Err(PipelineError::DependencyUnavailable(
            "LLM returned an empty completion".into(),
        ));
    }
    Ok(text.to_string())
}

/// Client for the Anthropic Messages API.
pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl AnthropicClient {
    pub fn new(
        base_url: String,
        model: String,
        api_key: String,
        timeout: Duration,
    ) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url,
            model,
            api_key,
        })
    }
}

impl LlmClient for AnthropicClient {
    fn chat<'a>(
        &'a self,
        request: &'a LlmRequest,
    ) -> Pin<Box<dyn Future<Output = Result<LlmResponse, PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let mut body = serde_json::json!({
                "model": self.model,
                "max_tokens": request.max_tokens,
                "messages": request.messages,
            });
            if let Some(system) = &request.system_prompt {
                body["system"] = serde_json::Value::String(system.clone());
            }

            let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
            let resp = self
                .http
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
                .send()
                .await
                .map_err(|e| {
                    PipelineError::DependencyUnavailable(format!("HTTP request failed: {e}"))
                })?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(PipelineError::DependencyUnavailable(format!(
                    "Anthropic API returned {status}: {body}"
                )));
            }

            let json: serde_json::Value = resp.json().await.map_err(|e| {
                PipelineError::DependencyUnavailable(format!("Failed to parse response: {e}"))
            })?;

            let content = json["content"]
                .as_array()
                .and_then(|blocks| {
                    blocks
                        .iter()
                        .find(|b| b["type"] == "text")
                        .and_then(|b| b["text"].as_str())
                })
                .ok_or_else(|| {
                    PipelineError::DependencyUnavailable("No text block in response".into())
                })?
                .to_string();

            Ok(LlmResponse { content })
        })
    }
}

pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleClient {
    pub fn new(
        base_url: String,
        model: String,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url,
            model,
            api_key,
        })
    }
}

impl LlmClient for OpenAiCompatibleClient {
    fn chat<'a>(
        &'a self,
        request: &'a LlmRequest,
    ) -> Pin<Box<dyn Future<Output = Result<LlmResponse, PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let mut messages = Vec::with_capacity(request.messages.len() + 1);
            if let Some(system) = &request.system_prompt {
                messages.push(serde_json::json!({
                    "role": "system",
                    "content": system,
                }));
            }
            for msg in &request.messages {
                messages.push(serde_json::json!({
                    "role": msg.role,
                    "content": msg.content,
                }));
            }

            let body = serde_json::json!({
                "model": self.model,
                "messages": messages,
                "max_tokens": request.max_tokens,
            });

            let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
            let mut req = self.http.post(&url).json(&body);

            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }

            let resp = req.send().await.map_err(|e| {
                PipelineError::DependencyUnavailable(format!("HTTP request failed: {e}"))
            })?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(PipelineError::DependencyUnavailable(format!(
                    "LLM API returned {status}: {body}"
                )));
            }

            let json: serde_json::Value = resp.json().await.map_err(|e| {
                PipelineError::DependencyUnavailable(format!("Failed to parse response: {e}"))
            })?;

            let content = json["choices"][0]["message"]["content"]
                .as_str()
                .ok_or_else(|| {
                    PipelineError::DependencyUnavailable("No content in response".into())
                })?
                .to_string();

            Ok(LlmResponse { content })
        })
    }
}

/// Stub LLM client that returns deterministic responses for testing.
pub struct StubLlmClient {
    responses: Vec<String>,
    call_count: std::sync::atomic::AtomicUsize,
}

impl StubLlmClient {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses,
            call_count: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Create a stub that always returns the given response.
    pub fn constant(response: &str) -> Self {
        Self::new(vec![response.to_string()])
    }

    pub fn calls(&self) -> usize {
        self.call_count.load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl LlmClient for StubLlmClient {
    fn chat<'a>(
        &'a self,
        _request: &'a LlmRequest,
    ) -> Pin<Box<dyn Future<Output = Result<LlmResponse, PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let idx = self
                .call_count
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let response = if self.responses.is_empty() {
                "stub response".to_string()
            } else {
                self.responses[idx % self.responses.len()].clone()
            };
            Ok(LlmResponse { content: response })
        })
    }
}

/// LLM client that is always unreachable. Used for degraded-mode tests.
pub struct UnavailableLlmClient;

impl LlmClient for UnavailableLlmClient {
    fn chat<'a>(
        &'a self,
        _request: &'a LlmRequest,
    ) -> Pin<Box<dyn Future<Output = Result<LlmResponse, PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            Err(PipelineError::DependencyUnavailable(
                "LLM provider unreachable".into(),
            ))
        })
    }
}

/// Extract a JSON object from an LLM response that may contain markdown
/// code fences or surrounding prose.
pub(crate) fn extract_json<T: serde::de::DeserializeOwned>(raw: &str) -> Option<T> {
    let trimmed = raw.trim();
    if let Ok(val) = serde_json::from_str::<T>(trimmed) {
        return Some(val);
    }

    if let Some(start) = trimmed.find('{')
        && let Some(end) = trimmed.rfind('}')
        && end > start
    {
        return serde_json::from_str::<T>(&trimmed[start..=end]).ok();
    }

    None
}
