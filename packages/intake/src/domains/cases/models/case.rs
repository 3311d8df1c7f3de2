use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use super::extraction::{IdentifyingFields, OptionalFields};

/// Normalized case number: the business key of a canonical case.
///
/// `"  nf-39281 "` and `"NF-39281"` are the same case.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseKey(String);

impl CaseKey {
    pub fn normalize(case_number: &str) -> Self {
        Self(case_number.trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "case_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    #[default]
    Pending,
    Confirmed,
    Completed,
}

/// The single authoritative record for one case number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalCase {
    pub case_key: CaseKey,
    pub identifying: IdentifyingFields,
    pub optional: OptionalFields,
    pub status: CaseStatus,
    /// Confidence of the extraction that last won (create or full overwrite)
    pub confidence: f64,
    /// Append-only
    pub notes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Store-managed; 0 means never persisted
    pub version: i64,
}

impl CanonicalCase {
    pub fn is_persisted(&self) -> bool {
        self.version > 0
    }
}

// =============================================================================
// Case Queries
// =============================================================================

#[derive(sqlx::FromRow)]
struct CaseRow {
    case_key: String,
    case_number: String,
    patient_name: String,
    exam_type: String,
    exam_date: Option<String>,
    exam_time: Option<String>,
    exam_location: Option<String>,
    referring_party: Option<String>,
    referring_email: Option<String>,
    report_due_date: Option<String>,
    status: CaseStatus,
    confidence: f64,
    notes: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl From<CaseRow> for CanonicalCase {
    fn from(row: CaseRow) -> Self {
        Self {
            case_key: CaseKey(row.case_key),
            identifying: IdentifyingFields {
                case_number: row.case_number,
                patient_name: row.patient_name,
                exam_type: row.exam_type,
            },
            optional: OptionalFields {
                exam_date: row.exam_date,
                exam_time: row.exam_time,
                exam_location: row.exam_location,
                referring_party: row.referring_party,
                referring_email: row.referring_email,
                report_due_date: row.report_due_date,
            },
            status: row.status,
            confidence: row.confidence,
            notes: row.notes,
            created_at: row.created_at,
            updated_at: row.updated_at,
            version: row.version,
        }
    }
}

const CASE_COLUMNS: &str = r#"
    case_key, case_number, patient_name, exam_type,
    exam_date, exam_time, exam_location, referring_party, referring_email, report_due_date,
    status, confidence, notes, created_at, updated_at, version
"#;

impl CanonicalCase {
    pub async fn find_by_key(key: &CaseKey, pool: &PgPool) -> Result<Option<Self>, sqlx::Error> {
        let row = sqlx::query_as::<_, CaseRow>(&format!(
            "SELECT {CASE_COLUMNS} FROM cases WHERE case_key = $1"
        ))
        .bind(key.as_str())
        .fetch_optional(pool)
        .await?;
        Ok(row.map(Into::into))
    }

    pub async fn find_all(pool: &PgPool) -> Result<Vec<Self>, sqlx::Error> {
        let rows = sqlx::query_as::<_, CaseRow>(&format!(
            "SELECT {CASE_COLUMNS} FROM cases ORDER BY case_key"
        ))
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Insert a new case at version 1. Returns `None` if the key is taken.
    pub async fn insert(&self, pool: &PgPool) -> Result<Option<Self>, sqlx::Error> {
        let row = sqlx::query_as::<_, CaseRow>(&format!(
            r#"
            INSERT INTO cases (
                case_key, case_number, patient_name, exam_type,
                exam_date, exam_time, exam_location, referring_party, referring_email,
                report_due_date, status, confidence, notes, created_at, updated_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, 1)
            ON CONFLICT (case_key) DO NOTHING
            RETURNING {CASE_COLUMNS}
            "#
        ))
        .bind(self.case_key.as_str())
        .bind(&self.identifying.case_number)
        .bind(&self.identifying.patient_name)
        .bind(&self.identifying.exam_type)
        .bind(&self.optional.exam_date)
        .bind(&self.optional.exam_time)
        .bind(&self.optional.exam_location)
        .bind(&self.optional.referring_party)
        .bind(&self.optional.referring_email)
        .bind(&self.optional.report_due_date)
        .bind(self.status)
        .bind(self.confidence)
        .bind(&self.notes)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_optional(pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Overwrite the stored case if it is still at `self.version`.
    ///
    /// Returns `None` when another writer got there first.
    pub async fn update_if_current(&self, pool: &PgPool) -> Result<Option<Self>, sqlx::Error> {
        let row = sqlx::query_as::<_, CaseRow>(&format!(
            r#"
            UPDATE cases
            SET case_number = $2,
                patient_name = $3,
                exam_type = $4,
                exam_date = $5,
                exam_time = $6,
                exam_location = $7,
                referring_party = $8,
                referring_email = $9,
                report_due_date = $10,
                status = $11,
                confidence = $12,
                notes = $13,
                updated_at = $14,
                version = version + 1
            WHERE case_key = $1
              AND version = $15
            RETURNING {CASE_COLUMNS}
            "#
        ))
        .bind(self.case_key.as_str())
        .bind(&self.identifying.case_number)
        .bind(&self.identifying.patient_name)
        .bind(&self.identifying.exam_type)
        .bind(&self.optional.exam_date)
        .bind(&self.optional.exam_time)
        .bind(&self.optional.exam_location)
        .bind(&self.optional.referring_party)
        .bind(&self.optional.referring_email)
        .bind(&self.optional.report_due_date)
        .bind(self.status)
        .bind(self.confidence)
        .bind(&self.notes)
        .bind(self.updated_at)
        .bind(self.version)
        .fetch_optional(pool)
        .await?;
        Ok(row.map(Into::into))
    }
}
