use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::PipelineError;
use crate::llm::{AnthropicClient, LlmClient, OpenAiCompatibleClient, StubLlmClient};

/// Env vars consulted for the provider credential, in order.
const API_KEY_ENV_VARS: [&str; 2] = ["KYC_LLM_API_KEY", "ANTHROPIC_API_KEY"];
const SUMMARIZER_URL_ENV_VAR: &str = "KYC_SUMMARIZER_URL";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KycConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub features: FeatureFlags,
    #[serde(default)]
    pub summarizer: Option<SummarizerConfig>,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: LlmProvider,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_base_url(),
            model: default_model(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> LlmProvider {
    LlmProvider::Anthropic
}
fn default_base_url() -> String {
    "https://api.anthropic.com".into()
}
fn default_model() -> String {
    "claude-3-5-sonnet-20241022".into()
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum LlmProvider {
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "openai-compatible")]
    OpenAiCompatible,
    #[serde(rename = "stub")]
    Stub,
}

/// Per-cascade switches for the LLM strategies. All default to off.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeatureFlags {
    #[serde(default)]
    pub llm_summary: bool,
    #[serde(default)]
    pub llm_rejection: bool,
    #[serde(default)]
    pub llm_translation: bool,
    #[serde(default)]
    pub llm_risk_assessment: bool,
}

/// External summarization endpoint. Absent means the strategy is disabled.
#[derive(Debug, Clone, Deserialize)]
pub struct SummarizerConfig {
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Deliveries per message before it is dead-lettered. 1 means no retry.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// How long a consumer's lease stays valid without a heartbeat. Messages
    /// held under an expired lease are returned to pending.
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dir: default_queue_dir(),
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_attempts(),
            lease_ms: default_lease_ms(),
        }
    }
}

impl QueueConfig {
    pub fn at(dir: PathBuf) -> Self {
        Self {
            dir,
            ..Self::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms.max(1))
    }
}

fn default_queue_dir() -> PathBuf {
    kyc_home().join("queue")
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_max_attempts() -> u32 {
    1
}
fn default_lease_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_dir")]
    pub dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
        }
    }
}

fn default_store_dir() -> PathBuf {
    kyc_home().join("records")
}

/// Base directory for local state: ~/.kyc/
pub fn kyc_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kyc")
}

/// The LLM client plus whether a credential was found for it.
#[derive(Clone)]
pub struct LlmHandle {
    pub client: Arc<dyn LlmClient>,
    pub has_credential: bool,
}

impl KycConfig {
    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let content = std::fs::read_to_string(path).map_err(PipelineError::IoError)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, PipelineError> {
        toml::from_str(content)
            .map_err(|e| PipelineError::Configuration(format!("Failed to parse config: {e}")))
    }

    /// Apply environment overrides for the credential and summarizer endpoint.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(key) = API_KEY_ENV_VARS
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        {
            self.llm.api_key = Some(key);
        }
        if let Ok(url) = std::env::var(SUMMARIZER_URL_ENV_VAR)
            && !url.is_empty()
        {
            let timeout_secs = self
                .summarizer
                .as_ref()
                .map_or_else(default_timeout_secs, |s| s.timeout_secs);
            self.summarizer = Some(SummarizerConfig { url, timeout_secs });
        }
        self
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.timeout_secs)
    }

    /// A stub provider needs no credential; the others need an API key.
    pub fn has_llm_credential(&self) -> bool {
        match self.llm.provider {
            LlmProvider::Stub => true,
            LlmProvider::OpenAiCompatible | LlmProvider::Anthropic => {
                self.llm.api_key.as_deref().is_some_and(|k| !k.is_empty())
            }
        }
    }

    pub fn build_llm_client(&self) -> Result<LlmHandle, PipelineError> {
        let timeout = self.llm_timeout();
        let client: Arc<dyn LlmClient> = match self.llm.provider {
            LlmProvider::Anthropic => Arc::new(AnthropicClient::new(
                self.llm.base_url.clone(),
                self.llm.model.clone(),
                self.llm.api_key.clone().unwrap_or_default(),
                timeout,
            )?),
            LlmProvider::OpenAiCompatible => Arc::new(OpenAiCompatibleClient::new(
                self.llm.base_url.clone(),
                self.llm.model.clone(),
                self.llm.api_key.clone(),
                timeout,
            )?),
            LlmProvider::Stub => Arc::new(StubLlmClient::constant("stub response")),
        };
        Ok(LlmHandle {
            client,
            has_credential: self.has_llm_credential(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = KycConfig::from_toml("").unwrap();
        assert_eq!(config.llm.provider, LlmProvider::Anthropic);
        assert_eq!(config.llm.timeout_secs, 30);
        assert!(!config.features.llm_summary);
        assert!(config.summarizer.is_none());
        assert_eq!(config.queue.max_attempts, 1);
        assert_eq!(config.queue.lease(), Duration::from_secs(30));
        assert!(config.queue.dir.ends_with("queue"));
        assert!(!config.has_llm_credential());
    }

    #[test]
    fn parses_stub_provider() {
        let config = KycConfig::from_toml(
            r#"
[llm]
provider = "stub"
"#,
        )
        .unwrap();
        assert_eq!(config.llm.provider, LlmProvider::Stub);
        assert!(config.has_llm_credential());
    }

    #[test]
    fn parses_full_config() {
        let config = KycConfig::from_toml(
            r#"
[llm]
provider = "openai-compatible"
base_url = "http://localhost:11434/v1"
model = "llama3"
api_key = "sk-test"
timeout_secs = 5

[features]
llm_summary = true
llm_translation = true

[summarizer]
url = "http://localhost:9000/summarize"

[queue]
dir = "/var/lib/kyc/queue"
poll_interval_ms = 50
max_attempts = 3

[store]
dir = "/var/lib/kyc/records"
"#,
        )
        .unwrap();
        assert_eq!(config.llm.api_key.as_deref(), Some("sk-test"));
        assert!(config.features.llm_summary);
        assert!(!config.features.llm_rejection);
        assert_eq!(
            config.summarizer.as_ref().unwrap().url,
            "http://localhost:9000/summarize"
        );
        assert_eq!(config.summarizer.as_ref().unwrap().timeout_secs, 30);
        assert_eq!(config.queue.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.store.dir, PathBuf::from("/var/lib/kyc/records"));
        assert!(config.has_llm_credential());
    }

    #[test]
    fn blank_api_key_is_not_a_credential() {
        let config = KycConfig::from_toml(
            r#"
[llm]
api_key = ""
"#,
        )
        .unwrap();
        assert!(!config.has_llm_credential());
    }

    #[test]
    fn rejects_unknown_provider() {
        let err = KycConfig::from_toml("[llm]\nprovider = \"mystery\"\n").unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }
}
