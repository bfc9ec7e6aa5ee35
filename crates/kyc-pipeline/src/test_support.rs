use kyc_core::SubmissionDraft;

pub fn jane_doe() -> SubmissionDraft {
    SubmissionDraft {
        full_name: "Jane Doe".into(),
        date_of_birth: "1990-05-02".into(),
        address: "1 Main St".into(),
        city: "Springfield".into(),
        country: "USA".into(),
        postal_code: "00001".into(),
        id_type: "passport".into(),
        id_number: "X123".into(),
        additional_info: String::new(),
        preferred_language: None,
    }
}
