use std::sync::LazyLock;

use chrono::{DateTime, Datelike, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CoreError;

static ID_TYPE_SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[_\-]+").expect("separator pattern is valid"));

/// Applicant-supplied KYC fields. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionDraft {
    pub full_name: String,
    /// As supplied: `YYYY-MM-DD` or an RFC 3339 timestamp.
    pub date_of_birth: String,
    pub address: String,
    pub city: String,
    pub country: String,
    pub postal_code: String,
    pub id_type: String,
    pub id_number: String,
    #[serde(default)]
    pub additional_info: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_language: Option<String>,
}

impl SubmissionDraft {
    /// Check that every required field is present and the birth date parses.
    pub fn validate(&self) -> Result<(), CoreError> {
        let required: [(&'static str, &str); 8] = [
            ("fullName", &self.full_name),
            ("dateOfBirth", &self.date_of_birth),
            ("address", &self.address),
            ("city", &self.city),
            ("country", &self.country),
            ("postalCode", &self.postal_code),
            ("idType", &self.id_type),
            ("idNumber", &self.id_number),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(CoreError::MissingField { field });
            }
        }
        self.birth_date()?;
        Ok(())
    }

    pub fn birth_date(&self) -> Result<NaiveDate, CoreError> {
        let raw = self.date_of_birth.trim();
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .or_else(|_| DateTime::parse_from_rfc3339(raw).map(|dt| dt.date_naive()))
            .map_err(|_| CoreError::InvalidDate {
                value: self.date_of_birth.clone(),
            })
    }

    /// `driving_license` -> `DRIVING LICENSE`.
    pub fn formatted_id_type(&self) -> String {
        ID_TYPE_SEPARATORS
            .replace_all(&self.id_type, " ")
            .to_uppercase()
    }

    /// Plain-text rendering used as the body for external summarizers.
    pub fn describe(&self) -> String {
        let additional = if self.additional_info.is_empty() {
            "None"
        } else {
            &self.additional_info
        };
        format!(
            "Full Name: {}\nDate of Birth: {}\nAddress: {}, {}, {} - {}\nID Type: {}\nID Number: {}\nAdditional Information: {}\n",
            self.full_name,
            self.date_of_birth,
            self.address,
            self.city,
            self.country,
            self.postal_code,
            self.id_type,
            self.id_number,
            additional,
        )
    }

    /// Short stable digest of the ID number, safe to put in logs.
    pub fn id_fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id_type.as_bytes());
        hasher.update(b":");
        hasher.update(self.id_number.as_bytes());
        let digest = hex::encode(hasher.finalize());
        digest[..12].to_string()
    }

    /// The preferred language if it is set and not English.
    pub fn translation_target(&self) -> Option<&str> {
        self.preferred_language
            .as_deref()
            .map(str::trim)
            .filter(|lang| !lang.is_empty() && *lang != "English")
    }
}

/// Whole years between `birth` and `today`, decremented when the birthday
/// has not yet occurred this year.
pub fn age_on(birth: NaiveDate, today: NaiveDate) -> i32 {
    let mut age = today.year() - birth.year();
    if (today.month(), today.day()) < (birth.month(), birth.day()) {
        age -= 1;
    }
    age
}
