//! Translation of summaries and rejection notices.
//!
//! Target languages are checked against a fixed whitelist before anything
//! else; an unknown language is the one error this module surfaces. Provider
//! trouble degrades to returning the input text unchanged.

use std::collections::BTreeMap;
use std::sync::Arc;

use kyc_core::cascade::{Cascade, CascadeStep, FallbackStep, StepFuture};
use kyc_core::review::DEFAULT_SOURCE_LANGUAGE;
use kyc_core::TranslationRequest;

use crate::config::KycConfig;
use crate::error::PipelineError;
use crate::llm::{LlmClient, complete};

pub const SUPPORTED_LANGUAGES: [&str; 20] = [
    "English",
    "Spanish",
    "French",
    "German",
    "Chinese",
    "Japanese",
    "Arabic",
    "Portuguese",
    "Russian",
    "Hindi",
    "Korean",
    "Italian",
    "Dutch",
    "Turkish",
    "Swedish",
    "Polish",
    "Vietnamese",
    "Thai",
    "Greek",
    "Hebrew",
];

const TRANSLATE_MAX_TOKENS: u32 = 500;
const DETECT_MAX_TOKENS: u32 = 50;

/// Exact, case-sensitive whitelist match.
pub fn is_supported_language(language: &str) -> bool {
    SUPPORTED_LANGUAGES.contains(&language)
}

fn ensure_supported(language: &str) -> Result<(), PipelineError> {
    if is_supported_language(language) {
        Ok(())
    } else {
        Err(PipelineError::UnsupportedLanguage {
            language: language.to_string(),
            supported: SUPPORTED_LANGUAGES.join(", "),
        })
    }
}

/// A summary and optional rejection reason rendered in one target language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedReview {
    pub summary: String,
    pub rejection_reason: Option<String>,
}

pub struct Translator {
    cascade: Cascade<TranslationRequest, String>,
    /// Present only when LLM translation is enabled and credentialed.
    llm: Option<Arc<dyn LlmClient>>,
}

impl Translator {
    pub fn new(config: &KycConfig, llm: Arc<dyn LlmClient>, has_credential: bool) -> Self {
        let enabled = config.features.llm_translation && has_credential;
        let mut cascade =
            Cascade::new("translation", Passthrough).with_timeout(config.llm_timeout());
        if enabled {
            cascade = cascade.with_step(LlmTranslation::new(llm.clone()));
        }
        Self {
            cascade,
            llm: enabled.then_some(llm),
        }
    }

    /// A translator that never calls a provider.
    pub fn disabled() -> Self {
        Self {
            cascade: Cascade::new("translation", Passthrough),
            llm: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.llm.is_some()
    }

    pub async fn translate(&self, request: &TranslationRequest) -> Result<String, PipelineError> {
        ensure_supported(&request.target_language)?;

        if request.target_language == request.source_language || request.text.trim().is_empty() {
            return Ok(request.text.clone());
        }

        let outcome = self.cascade.run(request).await;
        tracing::debug!(
            target_language = %request.target_language,
            step = %outcome.step,
            "Translation finished"
        );
        Ok(outcome.into_value())
    }

    /// Translate a summary and an optional rejection reason concurrently.
    ///
    /// Each field falls back to its original text independently.
    pub async fn translate_review(
        &self,
        summary: &str,
        rejection_reason: Option<&str>,
        target_language: &str,
    ) -> Result<TranslatedReview, PipelineError> {
        ensure_supported(target_language)?;

        let summary_req = TranslationRequest::new(summary, target_language);
        let reason_req = rejection_reason.map(|r| TranslationRequest::new(r, target_language));

        let (summary, rejection_reason) = tokio::join!(self.translate(&summary_req), async {
            match &reason_req {
                Some(req) => self.translate(req).await.map(Some),
                None => Ok(None),
            }
        });

        Ok(TranslatedReview {
            summary: summary?,
            rejection_reason: rejection_reason?,
        })
    }

    /// Translate one text into several languages, keyed by lowercase name.
    ///
    /// Unsupported languages are logged and left out of the map.
    pub async fn translate_many(&self, text: &str, languages: &[&str]) -> BTreeMap<String, String> {
        let mut translations = BTreeMap::new();
        for &language in languages {
            match self.translate(&TranslationRequest::new(text, language)).await {
                Ok(translated) => {
                    translations.insert(language.to_lowercase(), translated);
                }
                Err(e) => {
                    tracing::warn!(language, error = %e, "Skipping translation");
                }
            }
        }
        translations
    }

    /// Ask the provider which language `text` is written in.
    ///
    /// Returns `English` when translation is disabled and `Unknown` when the
    /// provider fails.
    pub async fn detect_language(&self, text: &str) -> String {
        let Some(llm) = &self.llm else {
            return DEFAULT_SOURCE_LANGUAGE.to_string();
        };
        let prompt = format!(
            "Detect the language of the following text and respond with only the language name in English.\n\nText: \"{text}\""
        );
        match complete(llm.as_ref(), prompt, DETECT_MAX_TOKENS).await {
            Ok(language) => language,
            Err(e) => {
                tracing::warn!(error = %e, "Language detection failed");
                "Unknown".to_string()
            }
        }
    }
}

pub struct LlmTranslation {
    llm: Arc<dyn LlmClient>,
}

impl LlmTranslation {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

fn translation_prompt(request: &TranslationRequest) -> String {
    format!(
        "Translate the following text from {} to {}.\n\nProvide only the translated text without any explanations or additional text.\n\nText to translate:\n\"{}\"",
        request.source_language, request.target_language, request.text
    )
}

impl CascadeStep<TranslationRequest, String> for LlmTranslation {
    fn name(&self) -> &str {
        "llm"
    }

    fn attempt<'a>(&'a self, input: &'a TranslationRequest) -> StepFuture<'a, String> {
        Box::pin(async move {
            let text =
                complete(self.llm.as_ref(), translation_prompt(input), TRANSLATE_MAX_TOKENS).await?;
            Ok(text)
        })
    }
}

/// Returns the input text unchanged.
pub struct Passthrough;

impl FallbackStep<TranslationRequest, String> for Passthrough {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn produce(&self, input: &TranslationRequest) -> String {
        input.text.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmRequest, LlmResponse, StubLlmClient, UnavailableLlmClient};
    use std::future::Future;
    use std::pin::Pin;

    fn enabled(llm: Arc<dyn LlmClient>) -> Translator {
        let mut config = KycConfig::default();
        config.features.llm_translation = true;
        Translator::new(&config, llm, true)
    }

    #[tokio::test]
    async fn unsupported_language_fails_when_disabled() {
        let err = Translator::disabled()
            .translate(&TranslationRequest::new("hello", "Klingon"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedLanguage { ref language, .. } if language == "Klingon"));
    }

    #[tokio::test]
    async fn unsupported_language_fails_when_enabled() {
        let llm = Arc::new(StubLlmClient::constant("nuqneH"));
        let translator = enabled(llm.clone());
        let err = translator
            .translate(&TranslationRequest::new("hello", "Klingon"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedLanguage { .. }));
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn whitelist_is_case_sensitive() {
        let err = Translator::disabled()
            .translate(&TranslationRequest::new("hello", "spanish"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedLanguage { .. }));
    }

    #[tokio::test]
    async fn english_target_is_unchanged_even_when_enabled() {
        let llm = Arc::new(StubLlmClient::constant("should not be used"));
        let translator = enabled(llm.clone());
        let out = translator
            .translate(&TranslationRequest::new("hello", "English"))
            .await
            .unwrap();
        assert_eq!(out, "hello");
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn disabled_translator_returns_input() {
        let out = Translator::disabled()
            .translate(&TranslationRequest::new("hello", "French"))
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn flag_without_credential_is_noop() {
        let mut config = KycConfig::default();
        config.features.llm_translation = true;
        let llm = Arc::new(StubLlmClient::constant("bonjour"));
        let translator = Translator::new(&config, llm.clone(), false);
        assert!(!translator.is_enabled());
        let out = translator
            .translate(&TranslationRequest::new("hello", "French"))
            .await
            .unwrap();
        assert_eq!(out, "hello");
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn enabled_translator_returns_trimmed_translation() {
        let translator = enabled(Arc::new(StubLlmClient::constant(" bonjour \n")));
        let out = translator
            .translate(&TranslationRequest::new("hello", "French"))
            .await
            .unwrap();
        assert_eq!(out, "bonjour");
    }

    #[tokio::test]
    async fn provider_failure_degrades_to_input() {
        let translator = enabled(Arc::new(UnavailableLlmClient));
        let out = translator
            .translate(&TranslationRequest::new("hello", "French"))
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }

    /// Fails whenever the prompt mentions the word "reason".
    struct FailsOnReason;
    impl LlmClient for FailsOnReason {
        fn chat<'a>(
            &'a self,
            request: &'a LlmRequest,
        ) -> Pin<Box<dyn Future<Output = Result<LlmResponse, PipelineError>> + Send + 'a>> {
            Box::pin(async move {
                let prompt = &request.messages[0].content;
                if prompt.contains("reason") {
                    Err(PipelineError::DependencyUnavailable("boom".into()))
                } else {
                    Ok(LlmResponse {
                        content: "resumen".into(),
                    })
                }
            })
        }
    }

    #[tokio::test]
    async fn review_fields_fall_back_independently() {
        let translator = enabled(Arc::new(FailsOnReason));
        let review = translator
            .translate_review("the summary", Some("the reason"), "Spanish")
            .await
            .unwrap();
        assert_eq!(review.summary, "resumen");
        assert_eq!(review.rejection_reason.as_deref(), Some("the reason"));
    }

    #[tokio::test]
    async fn review_without_reason() {
        let translator = enabled(Arc::new(StubLlmClient::constant("resumen")));
        let review = translator
            .translate_review("the summary", None, "Spanish")
            .await
            .unwrap();
        assert_eq!(review.summary, "resumen");
        assert_eq!(review.rejection_reason, None);
    }

    #[tokio::test]
    async fn review_rejects_unsupported_language() {
        let err = Translator::disabled()
            .translate_review("s", Some("r"), "Elvish")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedLanguage { .. }));
    }

    #[tokio::test]
    async fn translate_many_keys_by_lowercase_and_skips_unknown() {
        let translator = enabled(Arc::new(StubLlmClient::constant("translated")));
        let map = translator
            .translate_many("text", &["French", "Klingon", "German"])
            .await;
        assert_eq!(map.len(), 2);
        assert_eq!(map["french"], "translated");
        assert_eq!(map["german"], "translated");
    }

    #[tokio::test]
    async fn detect_language_defaults() {
        assert_eq!(Translator::disabled().detect_language("hola").await, "English");
        assert_eq!(
            enabled(Arc::new(UnavailableLlmClient)).detect_language("hola").await,
            "Unknown"
        );
        assert_eq!(
            enabled(Arc::new(StubLlmClient::constant("Spanish\n")))
                .detect_language("hola")
                .await,
            "Spanish"
        );
    }

    #[test]
    fn whitelist_has_twenty_languages() {
        assert_eq!(SUPPORTED_LANGUAGES.len(), 20);
        assert!(is_supported_language("Hebrew"));
        assert!(!is_supported_language("Klingon"));
    }
}
