use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;
use crate::submission::SubmissionDraft;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KycStatus {
    Pending,
    Approved,
    Rejected,
}

impl KycStatus {
    /// Pending and approved records block a new submission from the same user.
    pub fn is_active(self) -> bool {
        matches!(self, KycStatus::Pending | KycStatus::Approved)
    }
}

impl fmt::Display for KycStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KycStatus::Pending => write!(f, "pending"),
            KycStatus::Approved => write!(f, "approved"),
            KycStatus::Rejected => write!(f, "rejected"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub details: String,
    pub assessed_at: DateTime<Utc>,
}

/// What the worker derives from a submission before persisting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichmentResult {
    pub summary: String,
    pub risk_assessment: Option<RiskAssessment>,
    /// Summary translations keyed by lowercase language name.
    pub summary_translations: BTreeMap<String, String>,
}

impl EnrichmentResult {
    pub fn new(summary: String) -> Self {
        Self {
            summary,
            risk_assessment: None,
            summary_translations: BTreeMap::new(),
        }
    }
}

/// A persisted KYC submission and its review state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KycRecord {
    pub id: Uuid,
    pub user_id: String,
    /// The queue message this record was built from. Used to recognise redeliveries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    #[serde(flatten)]
    pub submission: SubmissionDraft,
    pub status: KycStatus,
    pub summary: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub summary_translations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_assessment: Option<RiskAssessment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rejection_reason_translations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl KycRecord {
    /// Build a new pending record from an enriched submission.
    pub fn pending(
        user_id: impl Into<String>,
        message_id: Option<Uuid>,
        submission: SubmissionDraft,
        enrichment: EnrichmentResult,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            message_id,
            submission,
            status: KycStatus::Pending,
            summary: enrichment.summary,
            summary_translations: enrichment.summary_translations,
            risk_assessment: enrichment.risk_assessment,
            rejection_reason: None,
            rejection_reason_translations: BTreeMap::new(),
            reviewed_by: None,
            reviewed_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn approve(&mut self, reviewer: impl Into<String>) -> Result<(), CoreError> {
        self.ensure_pending(KycStatus::Approved)?;
        self.status = KycStatus::Approved;
        self.reviewed_by = Some(reviewer.into());
        self.reviewed_at = Some(Utc::now());
        Ok(())
    }

    pub fn reject(
        &mut self,
        reviewer: impl Into<String>,
        reason: String,
        translations: BTreeMap<String, String>,
    ) -> Result<(), CoreError> {
        self.ensure_pending(KycStatus::Rejected)?;
        self.status = KycStatus::Rejected;
        self.reviewed_by = Some(reviewer.into());
        self.reviewed_at = Some(Utc::now());
        self.rejection_reason = Some(reason);
        self.rejection_reason_translations = translations;
        Ok(())
    }

    fn ensure_pending(&self, to: KycStatus) -> Result<(), CoreError> {
        if self.status != KycStatus::Pending {
            return Err(CoreError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::submission::fixtures::jane_doe;

    fn record() -> KycRecord {
        KycRecord::pending(
            "user-1",
            Some(Uuid::new_v4()),
            jane_doe(),
            EnrichmentResult::new("summary".into()),
        )
    }

    #[test]
    fn new_record_is_pending_and_active() {
        let r = record();
        assert_eq!(r.status, KycStatus::Pending);
        assert!(r.status.is_active());
        assert!(r.reviewed_at.is_none());
    }

    #[test]
    fn approve_sets_reviewer() {
        let mut r = record();
        r.approve("admin").unwrap();
        assert_eq!(r.status, KycStatus::Approved);
        assert_eq!(r.reviewed_by.as_deref(), Some("admin"));
        assert!(r.reviewed_at.is_some());
    }

    #[test]
    fn reject_records_reason_and_is_inactive() {
        let mut r = record();
        let mut translations = BTreeMap::new();
        translations.insert("spanish".to_string(), "rechazado".to_string());
        r.reject("admin", "rejected".into(), translations).unwrap();
        assert_eq!(r.status, KycStatus::Rejected);
        assert!(!r.status.is_active());
        assert_eq!(r.rejection_reason.as_deref(), Some("rejected"));
        assert_eq!(r.rejection_reason_translations["spanish"], "rechazado");
    }

    #[test]
    fn reviewed_records_cannot_transition_again() {
        let mut r = record();
        r.approve("admin").unwrap();
        let err = r.reject("admin", "late".into(), BTreeMap::new()).unwrap_err();
        assert_eq!(err.to_string(), "cannot move record from approved to rejected");
    }

    #[test]
    fn record_serializes_submission_inline() {
        let json = serde_json::to_value(record()).unwrap();
        assert_eq!(json["fullName"], "Jane Doe");
        assert_eq!(json["status"], "pending");
        assert!(json.get("rejectionReason").is_none());

        let back: KycRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.submission.city, "Springfield");
    }
}
