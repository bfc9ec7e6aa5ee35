use std::fmt;

use serde::{Deserialize, Serialize};

use crate::record::KycRecord;

/// Reviewer-selected reason for rejecting a submission.
///
/// Any value outside the fixed set deserializes (and parses) as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCategory {
    InvalidDocument,
    IncompleteInformation,
    DocumentMismatch,
    AddressVerificationFailed,
    DuplicateSubmission,
    ComplianceCheckFailed,
    #[serde(other)]
    Other,
}

impl RejectionCategory {
    pub const ALL: [RejectionCategory; 7] = [
        RejectionCategory::InvalidDocument,
        RejectionCategory::IncompleteInformation,
        RejectionCategory::DocumentMismatch,
        RejectionCategory::AddressVerificationFailed,
        RejectionCategory::DuplicateSubmission,
        RejectionCategory::ComplianceCheckFailed,
        RejectionCategory::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RejectionCategory::InvalidDocument => "invalid_document",
            RejectionCategory::IncompleteInformation => "incomplete_information",
            RejectionCategory::DocumentMismatch => "document_mismatch",
            RejectionCategory::AddressVerificationFailed => "address_verification_failed",
            RejectionCategory::DuplicateSubmission => "duplicate_submission",
            RejectionCategory::ComplianceCheckFailed => "compliance_check_failed",
            RejectionCategory::Other => "other",
        }
    }

    /// Lenient parse: unknown names map to `Other`.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == raw)
            .unwrap_or(RejectionCategory::Other)
    }
}

impl fmt::Display for RejectionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionRequest {
    pub full_name: String,
    pub id_type: String,
    pub id_number: String,
    #[serde(default)]
    pub category: Option<RejectionCategory>,
    #[serde(default)]
    pub custom_text: Option<String>,
}

impl RejectionRequest {
    pub fn for_record(
        record: &KycRecord,
        category: Option<RejectionCategory>,
        custom_text: Option<String>,
    ) -> Self {
        Self {
            full_name: record.submission.full_name.clone(),
            id_type: record.submission.id_type.clone(),
            id_number: record.submission.id_number.clone(),
            category,
            custom_text,
        }
    }

    /// The effective category; absent means `Other`.
    pub fn category(&self) -> RejectionCategory {
        self.category.unwrap_or(RejectionCategory::Other)
    }

    /// Custom text if it is present and not blank.
    pub fn custom_text(&self) -> Option<&str> {
        self.custom_text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

pub const DEFAULT_SOURCE_LANGUAGE: &str = "English";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationRequest {
    pub text: String,
    pub target_language: String,
    #[serde(default = "default_source_language")]
    pub source_language: String,
}

fn default_source_language() -> String {
    DEFAULT_SOURCE_LANGUAGE.into()
}

impl TranslationRequest {
    pub fn new(text: impl Into<String>, target_language: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            target_language: target_language.into(),
            source_language: default_source_language(),
        }
    }

    pub fn with_source(mut self, source_language: impl Into<String>) -> Self {
        self.source_language = source_language.into();
        self
    }
}
