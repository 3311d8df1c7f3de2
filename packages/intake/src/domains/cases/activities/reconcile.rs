//! Merge one extraction into the canonical case for its case number.
//!
//! [`reconcile`] is a pure function of `(existing, extraction, now)`. It
//! takes one of three branches:
//!
//! - no existing case: create it from the extraction
//! - `new.confidence > existing.confidence`: full overwrite
//! - otherwise: conservative merge (fill empty fields, record conflicts)
//!
//! Ties take the conservative branch, so stored confidence never regresses.
//! Notes are appended only when an identical entry is not already present,
//! which makes replaying the same merge a no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domains::cases::models::{
    CanonicalCase, CaseKey, CaseStatus, ExtractionResult, IdentifyingField, OptionalField,
    OptionalFields,
};

/// Missing any of these triggers a follow-up note.
pub const CRITICAL_FIELDS: [OptionalField; 3] = [
    OptionalField::ExamDate,
    OptionalField::ExamLocation,
    OptionalField::ReportDueDate,
];

/// Reported in the follow-up note, at lower severity.
pub const SEMI_CRITICAL_FIELDS: [OptionalField; 1] = [OptionalField::ExamTime];

pub const FOLLOW_UP_ACTION: &str =
    "Contact the referring party to confirm the missing details before scheduling.";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("invalid extraction: missing {}", join_fields(.0))]
    InvalidExtraction(Vec<IdentifyingField>),

    #[error("extraction for case {new} cannot merge into case {existing}")]
    KeyMismatch { existing: CaseKey, new: CaseKey },
}

fn join_fields(fields: &[IdentifyingField]) -> String {
    fields
        .iter()
        .map(IdentifyingField::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Which branch a merge took.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    Created,
    Overwritten { previous_confidence: f64 },
    Merged,
}

/// An optional field populated on both sides with different values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field: OptionalField,
    pub old_value: String,
    pub new_value: String,
}

/// Critical fields still empty after a merge, grouped by severity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingFields {
    pub critical: Vec<OptionalField>,
    pub semi_critical: Vec<OptionalField>,
}

impl MissingFields {
    pub fn of(fields: &OptionalFields) -> Self {
        let missing = |set: &[OptionalField]| -> Vec<OptionalField> {
            set.iter()
                .copied()
                .filter(|f| fields.value(*f).is_none())
                .collect()
        };
        Self {
            critical: missing(&CRITICAL_FIELDS),
            semi_critical: missing(&SEMI_CRITICAL_FIELDS),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.critical.is_empty() && self.semi_critical.is_empty()
    }

    pub fn follow_up_note(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }

        let list = |fields: &[OptionalField]| {
            fields
                .iter()
                .map(OptionalField::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut groups = Vec::new();
        if !self.critical.is_empty() {
            groups.push(format!("missing critical fields: {}", list(&self.critical)));
        }
        if !self.semi_critical.is_empty() {
            groups.push(format!(
                "missing semi-critical fields: {}",
                list(&self.semi_critical)
            ));
        }

        Some(format!(
            "FOLLOW-UP REQUIRED: {}. {}",
            groups.join("; "),
            FOLLOW_UP_ACTION
        ))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub case: CanonicalCase,
    pub outcome: MergeOutcome,
    pub conflicts: Vec<FieldConflict>,
    pub missing: MissingFields,
}

pub fn reconcile(
    existing: Option<&CanonicalCase>,
    extraction: &ExtractionResult,
    now: DateTime<Utc>,
) -> Result<Reconciliation, ReconcileError> {
    extraction
        .validate()
        .map_err(ReconcileError::InvalidExtraction)?;

    let key = extraction.case_key();
    let mut appended = Vec::new();
    let (mut case, outcome, conflicts) = match existing {
        None => (create(key, extraction, now), MergeOutcome::Created, Vec::new()),
        Some(existing) if existing.case_key != key => {
            return Err(ReconcileError::KeyMismatch {
                existing: existing.case_key.clone(),
                new: key,
            });
        }
        Some(existing) if extraction.confidence > existing.confidence => {
            appended.push(format!(
                "AUTO-UPDATED: higher confidence extraction ({} > {})",
                extraction.confidence, existing.confidence
            ));
            (
                overwrite(existing, extraction, now),
                MergeOutcome::Overwritten {
                    previous_confidence: existing.confidence,
                },
                Vec::new(),
            )
        }
        Some(existing) => {
            let (case, conflicts) = merge_conservative(existing, extraction, now);
            if let Some(note) = review_note(extraction, &conflicts) {
                appended.push(note);
            }
            (case, MergeOutcome::Merged, conflicts)
        }
    };

    if let Some(text) = extraction.note_text() {
        appended.push(format!("EXTRACTION NOTE: {text}"));
    }

    let missing = MissingFields::of(&case.optional);
    if let Some(note) = missing.follow_up_note() {
        appended.push(note);
    }

    append_notes(&mut case.notes, appended);

    Ok(Reconciliation {
        case,
        outcome,
        conflicts,
        missing,
    })
}

fn create(key: CaseKey, extraction: &ExtractionResult, now: DateTime<Utc>) -> CanonicalCase {
    CanonicalCase {
        case_key: key,
        identifying: extraction.identifying.clone(),
        optional: extraction.optional.clone(),
        status: CaseStatus::Pending,
        confidence: extraction.confidence,
        notes: Vec::new(),
        created_at: now,
        updated_at: now,
        version: 0,
    }
}

fn overwrite(
    existing: &CanonicalCase,
    extraction: &ExtractionResult,
    now: DateTime<Utc>,
) -> CanonicalCase {
    let mut case = existing.clone();
    case.identifying = extraction.identifying.clone();
    case.optional = extraction.optional.clone();
    case.confidence = extraction.confidence;
    case.updated_at = now;
    case
}

fn merge_conservative(
    existing: &CanonicalCase,
    extraction: &ExtractionResult,
    now: DateTime<Utc>,
) -> (CanonicalCase, Vec<FieldConflict>) {
    let mut case = existing.clone();
    let mut conflicts = Vec::new();

    for field in OptionalField::ALL {
        match (existing.optional.value(field), extraction.optional.value(field)) {
            (None, Some(_)) => {
                *case.optional.slot_mut(field) = extraction.optional.get(field).cloned();
            }
            (Some(old), Some(new)) if old != new => conflicts.push(FieldConflict {
                field,
                old_value: old.to_string(),
                new_value: new.to_string(),
            }),
            _ => {}
        }
    }

    case.updated_at = now;
    (case, conflicts)
}

fn review_note(extraction: &ExtractionResult, conflicts: &[FieldConflict]) -> Option<String> {
    if conflicts.is_empty() {
        return None;
    }
    let details = conflicts
        .iter()
        .map(|c| format!("{}: '{}' vs '{}'", c.field, c.old_value, c.new_value))
        .collect::<Vec<_>>()
        .join("; ");
    Some(format!(
        "MANUAL REVIEW NEEDED (low confidence: {}): {}",
        extraction.confidence, details
    ))
}

/// Append one merge's notes unless the log already ends with them.
///
/// Replaying a merge yields the same trailing notes, so nothing is added;
/// a later merge that raises the same note again still gets its own entry.
fn append_notes(notes: &mut Vec<String>, appended: Vec<String>) {
    if appended.is_empty() || notes.ends_with(&appended) {
        return;
    }
    notes.extend(appended);
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::domains::cases::models::{IdentifyingFields, Intent};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, minute, 0).unwrap()
    }

    fn extraction(case: &str, confidence: f64, optional: OptionalFields) -> ExtractionResult {
        ExtractionResult::builder()
            .identifying(IdentifyingFields::new(case, "Doe", "Ortho"))
            .optional(optional)
            .confidence(confidence)
            .intent(Intent::NewReferral)
            .build()
    }

    fn complete_optional() -> OptionalFields {
        OptionalFields::builder()
            .exam_date("2025-03-10")
            .exam_time("09:00")
            .exam_location("Portland, OR")
            .referring_party("Smith & Jones LLP")
            .referring_email("intake@smithjones.example")
            .report_due_date("2025-04-01")
            .build()
    }

    // =========================================================================
    // End-to-end scenarios
    // =========================================================================

    #[test]
    fn test_scenario_create_overwrite_then_conservative() {
        // A: no existing case, created as-is
        let a = extraction(
            "NF-1",
            0.9,
            OptionalFields::builder().exam_date("2025-03-10").build(),
        );
        let created = reconcile(None, &a, at(0)).unwrap();

        assert_eq!(created.outcome, MergeOutcome::Created);
        assert_eq!(created.case.case_key.as_str(), "NF-1");
        assert_eq!(created.case.identifying, a.identifying);
        assert_eq!(created.case.optional, a.optional);
        assert_eq!(created.case.status, CaseStatus::Pending);
        assert_eq!(created.case.confidence, 0.9);

        // B: lower-case case number, higher confidence, full overwrite
        let b = extraction(
            "nf-1",
            0.95,
            OptionalFields::builder().exam_date("2025-03-12").build(),
        );
        let overwritten = reconcile(Some(&created.case), &b, at(1)).unwrap();

        assert_eq!(
            overwritten.outcome,
            MergeOutcome::Overwritten {
                previous_confidence: 0.9
            }
        );
        assert_eq!(overwritten.case.case_key.as_str(), "NF-1");
        assert_eq!(
            overwritten.case.optional.exam_date.as_deref(),
            Some("2025-03-12")
        );
        assert_eq!(overwritten.case.confidence, 0.95);
        assert!(overwritten
            .case
            .notes
            .iter()
            .any(|n| n.contains("0.95 > 0.9")));

        // C: low confidence, populated exam_date kept, conflict recorded
        let c = extraction(
            "NF-1",
            0.4,
            OptionalFields::builder().exam_date("2025-03-20").build(),
        );
        let merged = reconcile(Some(&overwritten.case), &c, at(2)).unwrap();

        assert_eq!(merged.outcome, MergeOutcome::Merged);
        assert_eq!(merged.case.optional.exam_date.as_deref(), Some("2025-03-12"));
        assert_eq!(
            merged.conflicts,
            vec![FieldConflict {
                field: OptionalField::ExamDate,
                old_value: "2025-03-12".into(),
                new_value: "2025-03-20".into(),
            }]
        );
        assert!(merged.case.notes.iter().any(|n| n
            == "MANUAL REVIEW NEEDED (low confidence: 0.4): exam_date: '2025-03-12' vs '2025-03-20'"));
        assert_eq!(merged.case.confidence, 0.95);
    }

    // =========================================================================
    // Properties
    // =========================================================================

    #[test]
    fn test_create_copies_every_field() {
        let r = ExtractionResult::builder()
            .identifying(IdentifyingFields::new(" ab-77 ", "Roe", "Neurology"))
            .optional(complete_optional())
            .confidence(0.62)
            .build();

        let created = reconcile(None, &r, at(0)).unwrap().case;

        assert_eq!(created.identifying, r.identifying);
        assert_eq!(created.optional, r.optional);
        assert_eq!(created.confidence, 0.62);
        assert_eq!(created.case_key.as_str(), "AB-77");
        assert_eq!(created.created_at, at(0));
        assert_eq!(created.version, 0);
        assert!(created.notes.is_empty());
    }

    #[test]
    fn test_overwrite_replaces_absent_values_too() {
        let existing = reconcile(None, &extraction("NF-1", 0.5, complete_optional()), at(0))
            .unwrap()
            .case;

        let sparse = extraction(
            "NF-1",
            0.8,
            OptionalFields::builder().exam_date("2025-05-05").build(),
        );
        let result = reconcile(Some(&existing), &sparse, at(1)).unwrap();

        assert_eq!(result.case.optional, sparse.optional);
        assert_eq!(result.case.identifying, sparse.identifying);
        assert_eq!(result.case.confidence, 0.8);
        assert_eq!(result.case.created_at, at(0));
        assert_eq!(result.case.updated_at, at(1));
        assert!(result.case.notes[0].contains("0.8 > 0.5"));
    }

    #[test]
    fn test_equal_confidence_is_conservative() {
        let existing = reconcile(None, &extraction("NF-1", 0.7, complete_optional()), at(0))
            .unwrap()
            .case;

        let mut changed = complete_optional();
        changed.exam_location = Some("Salem, OR".into());
        let result = reconcile(Some(&existing), &extraction("NF-1", 0.7, changed), at(1)).unwrap();

        assert_eq!(result.outcome, MergeOutcome::Merged);
        assert_eq!(
            result.case.optional.exam_location.as_deref(),
            Some("Portland, OR")
        );
        assert_eq!(result.conflicts.len(), 1);
    }

    #[test]
    fn test_conservative_fills_empty_and_never_replaces() {
        let existing = reconcile(
            None,
            &extraction(
                "NF-1",
                0.9,
                OptionalFields::builder()
                    .exam_date("2025-03-10")
                    .exam_location("Portland, OR")
                    .build(),
            ),
            at(0),
        )
        .unwrap()
        .case;

        let incoming = extraction(
            "NF-1",
            0.3,
            OptionalFields::builder()
                .exam_date("2025-03-11")
                .exam_location(" Portland, OR ")
                .exam_time("10:30")
                .report_due_date("2025-04-02")
                .build(),
        );
        let result = reconcile(Some(&existing), &incoming, at(1)).unwrap();

        // populated fields untouched
        assert_eq!(result.case.optional.exam_date.as_deref(), Some("2025-03-10"));
        assert_eq!(
            result.case.optional.exam_location.as_deref(),
            Some("Portland, OR")
        );
        // empty fields filled
        assert_eq!(result.case.optional.exam_time.as_deref(), Some("10:30"));
        assert_eq!(
            result.case.optional.report_due_date.as_deref(),
            Some("2025-04-02")
        );
        // whitespace-only differences are not conflicts
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].field, OptionalField::ExamDate);
        assert_eq!(result.case.confidence, 0.9);
    }

    #[test]
    fn test_one_conflict_per_differing_field() {
        let existing = reconcile(None, &extraction("NF-1", 0.9, complete_optional()), at(0))
            .unwrap()
            .case;

        let mut other = complete_optional();
        other.exam_date = Some("2025-06-01".into());
        other.referring_email = Some("records@other.example".into());
        other.exam_time = None;

        let result = reconcile(Some(&existing), &extraction("NF-1", 0.2, other), at(1)).unwrap();

        let fields: Vec<OptionalField> = result.conflicts.iter().map(|c| c.field).collect();
        assert_eq!(
            fields,
            vec![OptionalField::ExamDate, OptionalField::ReferringEmail]
        );
        let review_notes: Vec<&String> = result
            .case
            .notes
            .iter()
            .filter(|n| n.starts_with("MANUAL REVIEW NEEDED"))
            .collect();
        assert_eq!(review_notes.len(), 1);
        assert!(review_notes[0].contains("exam_date: '2025-03-10' vs '2025-06-01'; referring_email"));
    }

    #[test]
    fn test_replay_is_idempotent() {
        let existing = reconcile(
            None,
            &extraction(
                "NF-1",
                0.9,
                OptionalFields::builder().exam_date("2025-03-10").build(),
            ),
            at(0),
        )
        .unwrap()
        .case;

        let mut incoming = extraction(
            "NF-1",
            0.4,
            OptionalFields::builder().exam_date("2025-03-20").build(),
        );
        incoming.notes = Some("Fax cover sheet partially illegible".into());

        let once = reconcile(Some(&existing), &incoming, at(1)).unwrap();
        let again = reconcile(Some(&existing), &incoming, at(1)).unwrap();
        assert_eq!(once, again);

        let replayed = reconcile(Some(&once.case), &incoming, at(1)).unwrap();
        assert_eq!(replayed.case, once.case);
    }

    #[test]
    fn test_overwrite_replay_is_idempotent() {
        let existing = reconcile(None, &extraction("NF-1", 0.5, complete_optional()), at(0))
            .unwrap()
            .case;
        let better = extraction("NF-1", 0.9, complete_optional());

        let once = reconcile(Some(&existing), &better, at(1)).unwrap();
        let replayed = reconcile(Some(&once.case), &better, at(1)).unwrap();

        assert_eq!(replayed.outcome, MergeOutcome::Merged);
        assert_eq!(replayed.case, once.case);
    }

    #[test]
    fn test_follow_up_lists_exactly_missing_fields() {
        let r = extraction(
            "NF-1",
            0.9,
            OptionalFields::builder()
                .exam_location("Portland, OR")
                .exam_time("09:00")
                .build(),
        );
        let result = reconcile(None, &r, at(0)).unwrap();

        assert_eq!(
            result.missing.critical,
            vec![OptionalField::ExamDate, OptionalField::ReportDueDate]
        );
        assert!(result.missing.semi_critical.is_empty());

        let follow_ups: Vec<&String> = result
            .case
            .notes
            .iter()
            .filter(|n| n.starts_with("FOLLOW-UP REQUIRED"))
            .collect();
        assert_eq!(follow_ups.len(), 1);
        assert!(follow_ups[0].contains("missing critical fields: exam_date, report_due_date."));
        assert!(!follow_ups[0].contains("exam_location"));
        assert!(!follow_ups[0].contains("semi-critical"));
        assert!(follow_ups[0].ends_with(FOLLOW_UP_ACTION));
    }

    #[test]
    fn test_follow_up_distinguishes_semi_critical() {
        let r = extraction(
            "NF-1",
            0.9,
            OptionalFields::builder()
                .exam_date("2025-03-10")
                .exam_location("Portland, OR")
                .report_due_date("2025-04-01")
                .build(),
        );
        let result = reconcile(None, &r, at(0)).unwrap();

        assert_eq!(
            result.case.notes,
            vec![format!(
                "FOLLOW-UP REQUIRED: missing semi-critical fields: exam_time. {FOLLOW_UP_ACTION}"
            )]
        );
    }

    #[test]
    fn test_follow_up_repeats_when_field_is_emptied_again() {
        let without_time = OptionalFields {
            exam_time: None,
            ..complete_optional()
        };
        let created = reconcile(None, &extraction("NF-1", 0.5, without_time.clone()), at(0))
            .unwrap()
            .case;

        let filled = reconcile(
            Some(&created),
            &extraction("NF-1", 0.4, OptionalFields::builder().exam_time("09:00").build()),
            at(1),
        )
        .unwrap();
        assert!(filled.missing.is_empty());
        assert_eq!(filled.case.notes, created.notes);

        let emptied = reconcile(Some(&filled.case), &extraction("NF-1", 0.9, without_time), at(2))
            .unwrap();

        let follow_up = format!(
            "FOLLOW-UP REQUIRED: missing semi-critical fields: exam_time. {FOLLOW_UP_ACTION}"
        );
        assert_eq!(
            emptied.case.notes,
            vec![
                follow_up.clone(),
                "AUTO-UPDATED: higher confidence extraction (0.9 > 0.5)".to_string(),
                follow_up,
            ]
        );
    }

    #[test]
    fn test_repeated_identical_merge_adds_nothing() {
        let existing = reconcile(None, &extraction("NF-1", 0.9, OptionalFields::default()), at(0))
            .unwrap()
            .case;
        let same = extraction("NF-1", 0.3, OptionalFields::default());

        let first = reconcile(Some(&existing), &same, at(1)).unwrap();
        let second = reconcile(Some(&first.case), &same, at(2)).unwrap();

        assert_eq!(first.case.notes.len(), 1);
        assert_eq!(second.case.notes, first.case.notes);
    }

    #[test]
    fn test_no_follow_up_when_complete() {
        let result = reconcile(None, &extraction("NF-1", 0.9, complete_optional()), at(0)).unwrap();
        assert!(result.missing.is_empty());
        assert!(result.case.notes.is_empty());
    }

    #[test]
    fn test_extraction_notes_appended() {
        let mut r = extraction("NF-1", 0.9, complete_optional());
        r.notes = Some("  Exam date inferred from attached letter  ".into());

        let result = reconcile(None, &r, at(0)).unwrap();
        assert_eq!(
            result.case.notes,
            vec!["EXTRACTION NOTE: Exam date inferred from attached letter".to_string()]
        );
    }

    #[test]
    fn test_invalid_extraction_rejected() {
        let r = ExtractionResult::builder()
            .identifying(IdentifyingFields::new("", "Doe", " "))
            .confidence(0.9)
            .build();

        let err = reconcile(None, &r, at(0)).unwrap_err();
        assert_eq!(
            err,
            ReconcileError::InvalidExtraction(vec![
                IdentifyingField::CaseNumber,
                IdentifyingField::ExamType
            ])
        );
        assert_eq!(
            err.to_string(),
            "invalid extraction: missing case_number, exam_type"
        );
    }

    #[test]
    fn test_key_mismatch_rejected() {
        let existing = reconcile(None, &extraction("NF-1", 0.9, complete_optional()), at(0))
            .unwrap()
            .case;
        let other = extraction("NF-2", 0.95, complete_optional());

        assert!(matches!(
            reconcile(Some(&existing), &other, at(1)),
            Err(ReconcileError::KeyMismatch { .. })
        ));
    }

    #[test]
    fn test_merge_keeps_status_and_version() {
        let mut existing = reconcile(None, &extraction("NF-1", 0.9, complete_optional()), at(0))
            .unwrap()
            .case;
        existing.status = CaseStatus::Confirmed;
        existing.version = 4;

        let low = reconcile(Some(&existing), &extraction("NF-1", 0.1, complete_optional()), at(1))
            .unwrap();
        let high = reconcile(Some(&existing), &extraction("NF-1", 0.99, complete_optional()), at(1))
            .unwrap();

        for case in [low.case, high.case] {
            assert_eq!(case.status, CaseStatus::Confirmed);
            assert_eq!(case.version, 4);
        }
    }
}
