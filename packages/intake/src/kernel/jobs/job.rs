//! Job model for queued ingestion work.
//!
//! A [`Job`] moves through `queued -> started -> finished | failed`, with
//! `failed -> queued` only through an explicit retry. The transition methods
//! here are pure (they take `now` and mutate in place) so every queue
//! backend applies exactly the same state machine.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use typed_builder::TypedBuilder;

use super::queue::{QueueError, RetryPolicy};
use crate::common::JobId;

/// Default attempt budget for a job (initial attempt plus four retries).
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "intake_job_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Queued,
    Started,
    Finished,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Started => "started",
            JobState::Finished => "finished",
            JobState::Failed => "failed",
        }
    }

    /// Terminal states are only left through an explicit retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Finished | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "intake_error_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient error - will retry if attempts remain
    #[default]
    Retryable,
    /// Permanent error - will not retry
    NonRetryable,
}

impl ErrorKind {
    /// Whether this error kind should trigger a retry
    pub fn should_retry(&self) -> bool {
        matches!(self, ErrorKind::Retryable)
    }
}

/// Failure reported by a job handler.
///
/// The message is stored verbatim as the job's `last_error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Retryable,
            message: message.into(),
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::NonRetryable,
            message: message.into(),
        }
    }
}

/// What happened to a job after a reported failure or an expired lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-queued; eligible again at `run_at`.
    Retrying { run_at: DateTime<Utc> },
    /// Attempts exhausted or the error was non-retryable.
    Failed,
}

/// One worker's claim on one attempt of a job, as handed out by `dequeue`.
///
/// `complete` and `fail` are only accepted while the job still carries this
/// claim. Once the lease expires and another worker claims the job, the
/// original holder's reports are rejected with [`QueueError::LeaseLost`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub job_id: JobId,
    pub worker_id: String,
    pub attempt: i32,
}

// ============================================================================
// Job Model
// ============================================================================

#[derive(FromRow, Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = JobId::new())]
    pub id: JobId,

    pub job_type: String,
    pub payload: serde_json::Value,

    // State
    #[builder(default)]
    pub state: JobState,
    #[builder(default = 0)]
    pub attempt_count: i32,
    #[builder(default = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: i32,

    // Error tracking
    #[builder(default)]
    pub last_error: Option<String>,
    #[builder(default)]
    pub error_kind: Option<ErrorKind>,

    // Lease management
    #[builder(default)]
    pub worker_id: Option<String>,
    #[builder(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,

    // Scheduling
    #[builder(default = Utc::now())]
    pub run_at: DateTime<Utc>,

    // Timestamps
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Queued now, eligible once `run_at` has passed.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Queued && self.run_at <= now
    }

    /// Queued but held back until a future `run_at` (retry backoff or schedule).
    pub fn is_scheduled(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Queued && self.run_at > now
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Started
            && self.lease_expires_at.is_some_and(|expires| expires <= now)
    }

    pub fn has_attempts_remaining(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    /// Deserialize the command payload.
    pub fn deserialize_payload<C: DeserializeOwned>(&self) -> Result<C, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// `queued -> started`. Counts the attempt and takes a lease.
    pub fn start(&mut self, worker_id: &str, lease: Duration, now: DateTime<Utc>) {
        self.state = JobState::Started;
        self.attempt_count += 1;
        self.worker_id = Some(worker_id.to_string());
        self.started_at = Some(now);
        self.lease_expires_at = Some(now + to_chrono(lease));
        self.updated_at = now;
    }

    /// The claim held by whoever started the current attempt.
    pub fn lease(&self) -> Lease {
        Lease {
            job_id: self.id,
            worker_id: self.worker_id.clone().unwrap_or_default(),
            attempt: self.attempt_count,
        }
    }

    /// `started -> finished`.
    pub fn finish(&mut self, lease: &Lease, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.expect_lease(lease, JobState::Finished)?;
        self.state = JobState::Finished;
        self.lease_expires_at = None;
        self.finished_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// `started -> queued` (with backoff) or `started -> failed`.
    pub fn fail(
        &mut self,
        lease: &Lease,
        error: &str,
        kind: ErrorKind,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, QueueError> {
        self.expect_lease(lease, JobState::Failed)?;

        self.last_error = Some(error.to_string());
        self.error_kind = Some(kind);
        self.lease_expires_at = None;
        self.updated_at = now;

        if kind.should_retry() && self.has_attempts_remaining() {
            let run_at = now + to_chrono(policy.delay_for(self.attempt_count));
            self.state = JobState::Queued;
            self.worker_id = None;
            self.run_at = run_at;
            Ok(FailOutcome::Retrying { run_at })
        } else {
            self.state = JobState::Failed;
            self.finished_at = Some(now);
            Ok(FailOutcome::Failed)
        }
    }

    /// `started -> queued` after the worker's lease ran out, or
    /// `started -> failed` when that was the last attempt.
    ///
    /// The attempt already counted at dequeue stays counted.
    pub fn reclaim(&mut self, now: DateTime<Utc>) -> FailOutcome {
        self.lease_expires_at = None;
        self.updated_at = now;

        if self.has_attempts_remaining() {
            self.state = JobState::Queued;
            self.worker_id = None;
            self.run_at = now;
            FailOutcome::Retrying { run_at: now }
        } else {
            self.state = JobState::Failed;
            self.last_error = Some(lease_expired_error(self.attempt_count));
            self.error_kind = Some(ErrorKind::Retryable);
            self.finished_at = Some(now);
            FailOutcome::Failed
        }
    }

    /// `failed -> queued` by operator request.
    pub fn requeue(&mut self, reset_attempts: bool, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.expect_state(JobState::Failed, JobState::Queued)?;
        self.state = JobState::Queued;
        self.worker_id = None;
        self.finished_at = None;
        self.run_at = now;
        self.updated_at = now;
        if reset_attempts {
            self.attempt_count = 0;
        }
        Ok(())
    }

    fn expect_lease(&self, lease: &Lease, to: JobState) -> Result<(), QueueError> {
        self.expect_state(JobState::Started, to)?;
        if self.worker_id.as_deref() != Some(lease.worker_id.as_str())
            || self.attempt_count != lease.attempt
        {
            return Err(QueueError::LeaseLost {
                id: self.id,
                worker_id: lease.worker_id.clone(),
                attempt: lease.attempt,
            });
        }
        Ok(())
    }

    fn expect_state(&self, expected: JobState, to: JobState) -> Result<(), QueueError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(QueueError::InvalidTransition {
                id: self.id,
                from: self.state,
                to,
            })
        }
    }
}

/// `last_error` recorded when the final attempt's lease runs out.
fn lease_expired_error(attempts: i32) -> String {
    format!("lease expired after {attempts} attempts")
}

/// Out-of-range durations saturate at one year so `now + d` cannot overflow.
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration)
        .unwrap_or_else(|_| chrono::Duration::days(365))
        .min(chrono::Duration::days(365))
}
