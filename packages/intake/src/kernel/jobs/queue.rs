//! Job queue contract.
//!
//! Backends ([`MemoryJobQueue`](super::MemoryJobQueue),
//! [`PostgresJobQueue`](super::PostgresJobQueue)) share the [`Job`] state
//! machine; this module defines the operations they expose and the retry
//! policy they apply.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::job::{ErrorKind, FailOutcome, Job, JobState, Lease, DEFAULT_MAX_ATTEMPTS};
use crate::common::JobId;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("job {id} is no longer leased to {worker_id} (attempt {attempt})")]
    LeaseLost {
        id: JobId,
        worker_id: String,
        attempt: i32,
    },

    #[error("failed to encode job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl From<sqlx::Error> for QueueError {
    fn from(e: sqlx::Error) -> Self {
        QueueError::Unavailable(e.to_string())
    }
}

/// Exponential backoff: `base * 2^(attempt - 1)`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given the number of attempts made so far.
    pub fn delay_for(&self, attempts_made: i32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).clamp(0, 30) as u32;
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}

/// Queue-wide settings shared by every backend.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Lease granted at dequeue. A started job whose lease runs out is
    /// re-queued, or failed if that was its last attempt.
    pub job_timeout: Duration,
    /// Attempt budget for jobs that do not ask for their own.
    pub max_attempts: i32,
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(600),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry: RetryPolicy::default(),
        }
    }
}

/// Counts by state. `queued` covers eligible jobs only; jobs waiting on a
/// future `run_at` are reported under `scheduled`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueueStatus {
    pub queued: i64,
    pub scheduled: i64,
    pub started: i64,
    pub finished: i64,
    pub failed: i64,
}

impl QueueStatus {
    pub fn total(&self) -> i64 {
        self.queued + self.scheduled + self.started + self.finished + self.failed
    }

    pub(crate) fn count(&mut self, job: &Job, now: DateTime<Utc>) {
        match job.state {
            JobState::Queued if job.is_scheduled(now) => self.scheduled += 1,
            JobState::Queued => self.queued += 1,
            JobState::Started => self.started += 1,
            JobState::Finished => self.finished += 1,
            JobState::Failed => self.failed += 1,
        }
    }
}

/// A job to be inserted.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub payload: serde_json::Value,
    /// Overrides [`QueueConfig::max_attempts`] when set.
    pub max_attempts: Option<i32>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            max_attempts: None,
        }
    }

    pub(crate) fn into_job(self, config: &QueueConfig, run_at: DateTime<Utc>) -> Job {
        let now = Utc::now();
        Job::builder()
            .job_type(self.job_type)
            .payload(self.payload)
            .max_attempts(self.max_attempts.unwrap_or(config.max_attempts))
            .run_at(run_at)
            .created_at(now)
            .updated_at(now)
            .build()
    }
}

/// Metadata for command serialization.
///
/// Commands implement this to name their job type.
pub trait CommandMeta {
    /// The command type name (used as job_type).
    fn command_type(&self) -> &'static str;

    /// Attempt budget override for this command.
    fn max_attempts(&self) -> Option<i32> {
        None
    }
}

/// Trait for job queue operations.
///
/// Claiming is exclusive: a job is handed to at most one worker at a time.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert a job eligible immediately.
    async fn enqueue(&self, job: NewJob) -> Result<JobId, QueueError>;

    /// Insert a job that becomes eligible at `run_at`.
    async fn schedule(&self, job: NewJob, run_at: DateTime<Utc>) -> Result<JobId, QueueError>;

    /// Claim the oldest eligible job for `worker_id`, if any.
    ///
    /// Expired leases are reclaimed first.
    async fn dequeue(&self, worker_id: &str) -> Result<Option<Job>, QueueError>;

    /// `started -> finished`. Rejected with [`QueueError::LeaseLost`] unless
    /// `lease` is the job's current claim.
    async fn complete(&self, lease: &Lease) -> Result<(), QueueError>;

    /// Record a failure. Retryable errors re-queue with backoff while attempts
    /// remain; anything else is terminal. Fenced by `lease` like `complete`.
    async fn fail(
        &self,
        lease: &Lease,
        error: &str,
        kind: ErrorKind,
    ) -> Result<FailOutcome, QueueError>;

    async fn status(&self) -> Result<QueueStatus, QueueError>;

    /// Re-queue started jobs whose lease has run out, failing those with no
    /// attempts left. Returns how many were reclaimed either way.
    async fn reclaim_expired(&self) -> Result<usize, QueueError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError>;

    /// Failed jobs, oldest failure first.
    async fn failed_jobs(&self) -> Result<Vec<Job>, QueueError>;

    /// `failed -> queued`. Attempts are kept unless `reset_attempts`.
    async fn retry(&self, job_id: JobId, reset_attempts: bool) -> Result<(), QueueError>;

    /// Re-queue every failed job. Returns how many.
    async fn retry_all_failed(&self) -> Result<usize, QueueError>;
}

/// Typed helpers over any [`JobQueue`].
#[async_trait]
pub trait JobQueueExt: JobQueue {
    /// Serialize a command and enqueue it under its command type.
    async fn enqueue_command<C>(&self, command: &C) -> Result<JobId, QueueError>
    where
        C: Serialize + CommandMeta + Sync,
    {
        self.enqueue(new_job(command)?).await
    }

    async fn schedule_command<C>(
        &self,
        command: &C,
        run_at: DateTime<Utc>,
    ) -> Result<JobId, QueueError>
    where
        C: Serialize + CommandMeta + Sync,
    {
        self.schedule(new_job(command)?, run_at).await
    }
}

impl<Q: JobQueue + ?Sized> JobQueueExt for Q {}

fn new_job<C: Serialize + CommandMeta>(command: &C) -> Result<NewJob, QueueError> {
    Ok(NewJob {
        job_type: command.command_type().to_string(),
        payload: serde_json::to_value(command)?,
        max_attempts: command.max_attempts(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_from_base() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=5).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(10),
        };
        assert_eq!(policy.delay_for(5), Duration::from_secs(10));
        assert_eq!(policy.delay_for(64), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_zero_attempts_uses_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
    }

    #[test]
    fn test_new_job_from_command() {
        #[derive(Serialize)]
        struct Ping {
            n: u32,
        }

        impl CommandMeta for Ping {
            fn command_type(&self) -> &'static str {
                "ping"
            }

            fn max_attempts(&self) -> Option<i32> {
                Some(2)
            }
        }

        let job = new_job(&Ping { n: 7 }).unwrap();
        assert_eq!(job.job_type, "ping");
        assert_eq!(job.payload, serde_json::json!({ "n": 7 }));
        assert_eq!(job.max_attempts, Some(2));
    }

    #[test]
    fn test_status_counts() {
        let now = Utc::now();
        let config = QueueConfig::default();
        let mut status = QueueStatus::default();

        let ready = NewJob::new("a", serde_json::json!({})).into_job(&config, now);
        let later = NewJob::new("a", serde_json::json!({}))
            .into_job(&config, now + chrono::Duration::minutes(5));

        status.count(&ready, now);
        status.count(&later, now);

        assert_eq!(status.queued, 1);
        assert_eq!(status.scheduled, 1);
        assert_eq!(status.total(), 2);
    }
}
