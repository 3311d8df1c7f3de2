//! Engine-wide error type.
//!
//! Every failure a job can hit is an [`IntakeError`]; [`IntakeError::kind`]
//! decides whether the queue retries it.

use thiserror::Error;

use crate::common::JobId;
use crate::domains::cases::activities::ReconcileError;
use crate::domains::cases::models::{CaseKey, IdentifyingField};
use crate::domains::cases::store::StoreError;
use crate::domains::extraction::ExtractionError;
use crate::kernel::jobs::{ErrorKind, JobFailure, QueueError, RegistryError};
use crate::kernel::RenderError;

pub type Result<T, E = IntakeError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("worker name already registered: {0}")]
    WorkerNameConflict(String),

    #[error("render error: {0}")]
    Render(#[from] RenderError),

    #[error("extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("invalid extraction: missing {}", join_fields(.missing))]
    InvalidExtraction { missing: Vec<IdentifyingField> },

    #[error("case store error: {0}")]
    Store(#[from] StoreError),

    #[error("case lock for {held} cannot write case {target}")]
    LockNotHeld { held: CaseKey, target: CaseKey },

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("invalid job transition: {0}")]
    InvalidTransition(String),

    #[error("invalid job payload: {0}")]
    Payload(String),
}

fn join_fields(fields: &[IdentifyingField]) -> String {
    fields
        .iter()
        .map(IdentifyingField::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

impl IntakeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IntakeError::QueueUnavailable(_)
            | IntakeError::Render(_)
            | IntakeError::Extraction(_)
            | IntakeError::Store(_) => ErrorKind::Retryable,
            IntakeError::WorkerNameConflict(_)
            | IntakeError::InvalidExtraction { .. }
            | IntakeError::LockNotHeld { .. }
            | IntakeError::JobNotFound(_)
            | IntakeError::InvalidTransition(_)
            | IntakeError::Payload(_) => ErrorKind::NonRetryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().should_retry()
    }
}

impl From<QueueError> for IntakeError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Unavailable(msg) => IntakeError::QueueUnavailable(msg),
            QueueError::NotFound(id) => IntakeError::JobNotFound(id),
            e @ (QueueError::InvalidTransition { .. } | QueueError::LeaseLost { .. }) => {
                IntakeError::InvalidTransition(e.to_string())
            }
            QueueError::Payload(e) => IntakeError::Payload(e.to_string()),
        }
    }
}

impl From<RegistryError> for IntakeError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NameConflict(name) => IntakeError::WorkerNameConflict(name),
            RegistryError::Unavailable(msg) => IntakeError::QueueUnavailable(msg),
        }
    }
}

impl From<ReconcileError> for IntakeError {
    fn from(e: ReconcileError) -> Self {
        match e {
            ReconcileError::InvalidExtraction(missing) => IntakeError::InvalidExtraction { missing },
            ReconcileError::KeyMismatch { existing, new } => IntakeError::LockNotHeld {
                held: existing,
                target: new,
            },
        }
    }
}

impl From<IntakeError> for JobFailure {
    fn from(e: IntakeError) -> Self {
        JobFailure {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}
