//! Rejection notice generation: an LLM-written notice, falling back to a
//! fixed template per rejection category.

use std::sync::Arc;

use kyc_core::cascade::{Cascade, CascadeStep, FallbackStep, StepFuture};
use kyc_core::{RejectionCategory, RejectionRequest};

use crate::config::KycConfig;
use crate::llm::{LlmClient, complete};

pub type RejectionCascade = Cascade<RejectionRequest, String>;

const REJECTION_MAX_TOKENS: u32 = 250;
const DEFAULT_LLM_REASON: &str = "Failed compliance checks";
const DEFAULT_OTHER_REASON: &str = "Failed verification";

pub fn build_rejection_cascade(
    config: &KycConfig,
    llm: Arc<dyn LlmClient>,
    has_credential: bool,
) -> RejectionCascade {
    let cascade = Cascade::new("rejection", TemplateRejection).with_timeout(config.llm_timeout());
    if config.features.llm_rejection && has_credential {
        cascade.with_step(LlmRejection::new(llm))
    } else {
        cascade
    }
}

pub struct LlmRejection {
    llm: Arc<dyn LlmClient>,
}

impl LlmRejection {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

fn rejection_prompt(request: &RejectionRequest) -> String {
    let reason = match (request.custom_text(), request.category) {
        (Some(text), _) => text.to_string(),
        (None, Some(category)) => category.to_string(),
        (None, None) => DEFAULT_LLM_REASON.to_string(),
    };
    format!(
        "You are a professional KYC compliance officer writing a rejection notice. Generate a professional and courteous rejection reason (2-3 sentences) for the following KYC submission that is being rejected.

Applicant Name: {}
ID Type: {}
ID Number: {}
Rejection Reason: {}

The rejection reason should be:
- Professional and courteous
- Clear about why the submission was rejected
- Suggest what improvements are needed (if applicable)
- Encourage resubmission with correct information",
        request.full_name, request.id_type, request.id_number, reason,
    )
}

impl CascadeStep<RejectionRequest, String> for LlmRejection {
    fn name(&self) -> &str {
        "llm"
    }

    fn attempt<'a>(&'a self, input: &'a RejectionRequest) -> StepFuture<'a, String> {
        Box::pin(async move {
            let text =
                complete(self.llm.as_ref(), rejection_prompt(input), REJECTION_MAX_TOKENS).await?;
            Ok(text)
        })
    }
}

/// Fixed per-category notices. Always available.
pub struct TemplateRejection;

impl FallbackStep<RejectionRequest, String> for TemplateRejection {
    fn name(&self) -> &str {
        "template"
    }

    fn produce(&self, input: &RejectionRequest) -> String {
        rejection_template(input)
    }
}

pub fn rejection_template(request: &RejectionRequest) -> String {
    let name = &request.full_name;
    let id_type = &request.id_type;
    match request.category() {
        RejectionCategory::InvalidDocument => format!(
            "Dear {name}, Your KYC application has been rejected due to invalid or unverifiable identification document. Please resubmit with a valid {id_type} that is clearly legible and within the validity period. If you have questions, please contact our support team."
        ),
        RejectionCategory::IncompleteInformation => format!(
            "Dear {name}, Your KYC submission is incomplete. Required information is missing or unclear. Please review your submission and resubmit with all mandatory fields completed accurately."
        ),
        RejectionCategory::DocumentMismatch => format!(
            "Dear {name}, There is a mismatch between the information provided and your identification document. Please ensure all details match your {id_type} exactly and resubmit."
        ),
        RejectionCategory::AddressVerificationFailed => format!(
            "Dear {name}, We were unable to verify your address. Please provide a valid proof of residence along with your KYC documents and resubmit."
        ),
        RejectionCategory::DuplicateSubmission => format!(
            "Dear {name}, A KYC submission with your identification number already exists in our system. If you believe this is an error, please contact our support team."
        ),
        RejectionCategory::ComplianceCheckFailed => format!(
            "Dear {name}, Your submission did not pass our compliance and verification checks. We recommend reviewing the requirements and resubmitting with accurate information."
        ),
        RejectionCategory::Other => {
            let reason = request.custom_text().unwrap_or(DEFAULT_OTHER_REASON);
            format!(
                "Dear {name}, Your KYC application has been rejected. Reason: {reason}. Please correct the issues and resubmit your application."
            )
        }
    }
}
