use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use super::case::CaseKey;

/// What the sender wants, as judged by the extraction service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    NewReferral,
    SchedulingUpdate,
    DocumentSubmission,
    Inquiry,
    #[default]
    Other,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::NewReferral => "new_referral",
            Intent::SchedulingUpdate => "scheduling_update",
            Intent::DocumentSubmission => "document_submission",
            Intent::Inquiry => "inquiry",
            Intent::Other => "other",
        }
    }

    /// Unknown labels map to [`Intent::Other`].
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

impl FromStr for Intent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "new_referral" => Ok(Intent::NewReferral),
            "scheduling_update" => Ok(Intent::SchedulingUpdate),
            "document_submission" => Ok(Intent::DocumentSubmission),
            "inquiry" => Ok(Intent::Inquiry),
            "other" => Ok(Intent::Other),
            other => Err(format!("unknown intent: {other}")),
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentCategory {
    MedicalRecords,
    Declaration,
    CoverLetter,
    #[default]
    Other,
}

impl AttachmentCategory {
    /// Unknown labels map to [`AttachmentCategory::Other`].
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "medical_records" => AttachmentCategory::MedicalRecords,
            "declaration" => AttachmentCategory::Declaration,
            "cover_letter" => AttachmentCategory::CoverLetter,
            _ => AttachmentCategory::Other,
        }
    }
}

/// Per-attachment classification. Informational; never merged into a case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentClassification {
    pub filename: String,
    pub category: AttachmentCategory,
    pub category_reason: Option<String>,
}

/// Fields that identify a case. All three are required.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyingFields {
    pub case_number: String,
    pub patient_name: String,
    pub exam_type: String,
}

impl IdentifyingFields {
    pub fn new(
        case_number: impl Into<String>,
        patient_name: impl Into<String>,
        exam_type: impl Into<String>,
    ) -> Self {
        Self {
            case_number: case_number.into(),
            patient_name: patient_name.into(),
            exam_type: exam_type.into(),
        }
    }

    /// Fields that are blank after trimming.
    pub fn missing(&self) -> Vec<IdentifyingField> {
        IdentifyingField::ALL
            .into_iter()
            .filter(|field| self.get(*field).trim().is_empty())
            .collect()
    }

    pub fn get(&self, field: IdentifyingField) -> &str {
        match field {
            IdentifyingField::CaseNumber => &self.case_number,
            IdentifyingField::PatientName => &self.patient_name,
            IdentifyingField::ExamType => &self.exam_type,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifyingField {
    CaseNumber,
    PatientName,
    ExamType,
}

impl IdentifyingField {
    pub const ALL: [IdentifyingField; 3] = [
        IdentifyingField::CaseNumber,
        IdentifyingField::PatientName,
        IdentifyingField::ExamType,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifyingField::CaseNumber => "case_number",
            IdentifyingField::PatientName => "patient_name",
            IdentifyingField::ExamType => "exam_type",
        }
    }
}

impl fmt::Display for IdentifyingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling and contact details; any of them may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option, into)))]
pub struct OptionalFields {
    pub exam_date: Option<String>,
    pub exam_time: Option<String>,
    pub exam_location: Option<String>,
    pub referring_party: Option<String>,
    pub referring_email: Option<String>,
    pub report_due_date: Option<String>,
}

impl OptionalFields {
    pub fn get(&self, field: OptionalField) -> Option<&String> {
        match field {
            OptionalField::ExamDate => self.exam_date.as_ref(),
            OptionalField::ExamTime => self.exam_time.as_ref(),
            OptionalField::ExamLocation => self.exam_location.as_ref(),
            OptionalField::ReferringParty => self.referring_party.as_ref(),
            OptionalField::ReferringEmail => self.referring_email.as_ref(),
            OptionalField::ReportDueDate => self.report_due_date.as_ref(),
        }
    }

    pub fn slot_mut(&mut self, field: OptionalField) -> &mut Option<String> {
        match field {
            OptionalField::ExamDate => &mut self.exam_date,
            OptionalField::ExamTime => &mut self.exam_time,
            OptionalField::ExamLocation => &mut self.exam_location,
            OptionalField::ReferringParty => &mut self.referring_party,
            OptionalField::ReferringEmail => &mut self.referring_email,
            OptionalField::ReportDueDate => &mut self.report_due_date,
        }
    }

    /// Trimmed value, with blank treated as absent.
    pub fn value(&self, field: OptionalField) -> Option<&str> {
        self.get(field)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionalField {
    ExamDate,
    ExamTime,
    ExamLocation,
    ReferringParty,
    ReferringEmail,
    ReportDueDate,
}

impl OptionalField {
    pub const ALL: [OptionalField; 6] = [
        OptionalField::ExamDate,
        OptionalField::ExamTime,
        OptionalField::ExamLocation,
        OptionalField::ReferringParty,
        OptionalField::ReferringEmail,
        OptionalField::ReportDueDate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OptionalField::ExamDate => "exam_date",
            OptionalField::ExamTime => "exam_time",
            OptionalField::ExamLocation => "exam_location",
            OptionalField::ReferringParty => "referring_party",
            OptionalField::ReferringEmail => "referring_email",
            OptionalField::ReportDueDate => "report_due_date",
        }
    }
}

impl fmt::Display for OptionalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much human attention an extraction needs, judged by its confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewRecommendation {
    AutoProcess,
    NeedsReview,
    RequiresManual,
}

impl ReviewRecommendation {
    pub const AUTO_PROCESS_THRESHOLD: f64 = 0.8;
    pub const NEEDS_REVIEW_THRESHOLD: f64 = 0.5;

    pub fn for_confidence(confidence: f64) -> Self {
        if confidence >= Self::AUTO_PROCESS_THRESHOLD {
            ReviewRecommendation::AutoProcess
        } else if confidence >= Self::NEEDS_REVIEW_THRESHOLD {
            ReviewRecommendation::NeedsReview
        } else {
            ReviewRecommendation::RequiresManual
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewRecommendation::AutoProcess => "auto_process",
            ReviewRecommendation::NeedsReview => "needs_review",
            ReviewRecommendation::RequiresManual => "requires_manual",
        }
    }
}

impl fmt::Display for ReviewRecommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured record produced by the extraction service for one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct ExtractionResult {
    pub identifying: IdentifyingFields,
    #[builder(default)]
    pub optional: OptionalFields,
    /// Self-reported confidence in [0, 1]
    pub confidence: f64,
    #[builder(default, setter(strip_option, into))]
    pub notes: Option<String>,
    #[builder(default)]
    pub intent: Intent,
    #[builder(default)]
    pub attachments: Vec<AttachmentClassification>,
}

impl ExtractionResult {
    /// Every identifying field must be present and non-blank.
    pub fn validate(&self) -> Result<(), Vec<IdentifyingField>> {
        let missing = self.identifying.missing();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(missing)
        }
    }

    pub fn case_key(&self) -> CaseKey {
        CaseKey::normalize(&self.identifying.case_number)
    }

    pub fn review(&self) -> ReviewRecommendation {
        ReviewRecommendation::for_confidence(self.confidence)
    }

    /// Extraction notes, if any survive trimming.
    pub fn note_text(&self) -> Option<&str> {
        self.notes
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
    }
}
