//! PostgreSQL-backed job queue and worker registry.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` so concurrent workers never
//! receive the same job. Completion, failure and retry lock the row, apply
//! the shared [`Job`] state machine, and write the row back in one
//! transaction. Completion and failure are fenced: the write only happens
//! when the locked row still carries the caller's worker id and attempt.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info, warn};

use super::job::{ErrorKind, FailOutcome, Job, JobState, Lease};
use super::queue::{JobQueue, NewJob, QueueConfig, QueueError, QueueStatus};
use super::registry::{RegistryError, WorkerRegistration, WorkerRegistry};
use crate::common::JobId;

const JOB_COLUMNS: &str = r#"
    id, job_type, payload, state, attempt_count, max_attempts, last_error, error_kind,
    worker_id, lease_expires_at, run_at, created_at, started_at, finished_at, updated_at
"#;

/// PostgreSQL-backed job queue implementation.
#[derive(Clone)]
pub struct PostgresJobQueue {
    pool: PgPool,
    config: QueueConfig,
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool, config: QueueConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert(&self, job: NewJob, run_at: DateTime<Utc>) -> Result<JobId, QueueError> {
        let job = job.into_job(&self.config, run_at);

        sqlx::query(
            r#"
            INSERT INTO intake_jobs (
                id, job_type, payload, state, attempt_count, max_attempts,
                run_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(job.id)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.state)
        .bind(job.attempt_count)
        .bind(job.max_attempts)
        .bind(job.run_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        debug!(job_id = %job.id, job_type = %job.job_type, run_at = %run_at, "job enqueued");
        Ok(job.id)
    }

    /// Lock a job row for the rest of the transaction.
    async fn lock_job(
        tx: &mut Transaction<'_, Postgres>,
        job_id: JobId,
    ) -> Result<Job, QueueError> {
        sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM intake_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(job_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(QueueError::NotFound(job_id))
    }

    /// Persist a transitioned row.
    ///
    /// `holder` fences the write to the claim that was checked under the
    /// row lock, so a claim that changed in between can never be overwritten.
    async fn write_back(
        tx: &mut Transaction<'_, Postgres>,
        job: &Job,
        holder: Option<&Lease>,
    ) -> Result<(), QueueError> {
        let written = sqlx::query(
            r#"
            UPDATE intake_jobs
            SET state = $2,
                attempt_count = $3,
                last_error = $4,
                error_kind = $5,
                worker_id = $6,
                lease_expires_at = $7,
                run_at = $8,
                started_at = $9,
                finished_at = $10,
                updated_at = $11
            WHERE id = $1
              AND ($12::TEXT IS NULL OR (worker_id = $12 AND attempt_count = $13))
            "#,
        )
        .bind(job.id)
        .bind(job.state)
        .bind(job.attempt_count)
        .bind(&job.last_error)
        .bind(job.error_kind)
        .bind(&job.worker_id)
        .bind(job.lease_expires_at)
        .bind(job.run_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.updated_at)
        .bind(holder.map(|lease| lease.worker_id.as_str()))
        .bind(holder.map(|lease| lease.attempt))
        .execute(&mut **tx)
        .await?;

        match holder {
            Some(lease) if written.rows_affected() == 0 => Err(QueueError::LeaseLost {
                id: job.id,
                worker_id: lease.worker_id.clone(),
                attempt: lease.attempt,
            }),
            _ => Ok(()),
        }
    }

    /// Apply a transition to a locked row and persist it.
    async fn transition<T: Send>(
        &self,
        job_id: JobId,
        holder: Option<&Lease>,
        apply: impl FnOnce(&mut Job) -> Result<T, QueueError> + Send,
    ) -> Result<T, QueueError> {
        let mut tx = self.pool.begin().await?;
        let mut job = Self::lock_job(&mut tx, job_id).await?;
        let result = apply(&mut job)?;
        Self::write_back(&mut tx, &job, holder).await?;
        tx.commit().await?;
        Ok(result)
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, QueueError> {
        self.insert(job, Utc::now()).await
    }

    async fn schedule(&self, job: NewJob, run_at: DateTime<Utc>) -> Result<JobId, QueueError> {
        self.insert(job, run_at).await
    }

    async fn dequeue(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        self.reclaim_expired().await?;

        let lease_ms = self.config.job_timeout.as_millis() as i64;
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            WITH next_job AS (
                SELECT id
                FROM intake_jobs
                WHERE state = 'queued'
                  AND run_at <= NOW()
                ORDER BY run_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE intake_jobs
            SET state = 'started',
                attempt_count = attempt_count + 1,
                worker_id = $1,
                started_at = NOW(),
                lease_expires_at = NOW() + ($2 * INTERVAL '1 millisecond'),
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_job)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(worker_id)
        .bind(lease_ms)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(job) = &job {
            debug!(job_id = %job.id, worker_id = %worker_id, attempt = job.attempt_count, "job claimed");
        }
        Ok(job)
    }

    async fn complete(&self, lease: &Lease) -> Result<(), QueueError> {
        self.transition(lease.job_id, Some(lease), |job| job.finish(lease, Utc::now()))
            .await
    }

    async fn fail(
        &self,
        lease: &Lease,
        error: &str,
        kind: ErrorKind,
    ) -> Result<FailOutcome, QueueError> {
        let policy = self.config.retry;
        self.transition(lease.job_id, Some(lease), |job| {
            job.fail(lease, error, kind, &policy, Utc::now())
        })
        .await
    }

    async fn status(&self) -> Result<QueueStatus, QueueError> {
        self.reclaim_expired().await?;

        let status = sqlx::query_as::<_, QueueStatus>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE state = 'queued' AND run_at <= NOW()) AS queued,
                COUNT(*) FILTER (WHERE state = 'queued' AND run_at > NOW()) AS scheduled,
                COUNT(*) FILTER (WHERE state = 'started') AS started,
                COUNT(*) FILTER (WHERE state = 'finished') AS finished,
                COUNT(*) FILTER (WHERE state = 'failed') AS failed
            FROM intake_jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(status)
    }

    async fn reclaim_expired(&self) -> Result<usize, QueueError> {
        let reclaimed: Vec<(JobId, Option<String>, i32, JobState)> = sqlx::query_as(
            r#"
            WITH expired AS (
                SELECT id, worker_id, attempt_count < max_attempts AS has_attempts
                FROM intake_jobs
                WHERE state = 'started'
                  AND lease_expires_at <= NOW()
                FOR UPDATE SKIP LOCKED
            )
            UPDATE intake_jobs j
            SET state = CASE WHEN expired.has_attempts
                             THEN 'queued'::intake_job_state
                             ELSE 'failed'::intake_job_state END,
                worker_id = CASE WHEN expired.has_attempts THEN NULL ELSE j.worker_id END,
                last_error = CASE WHEN expired.has_attempts THEN j.last_error
                                  ELSE 'lease expired after ' || j.attempt_count || ' attempts' END,
                error_kind = CASE WHEN expired.has_attempts THEN j.error_kind
                                  ELSE 'retryable'::intake_error_kind END,
                finished_at = CASE WHEN expired.has_attempts THEN j.finished_at ELSE NOW() END,
                run_at = CASE WHEN expired.has_attempts THEN NOW() ELSE j.run_at END,
                lease_expires_at = NULL,
                updated_at = NOW()
            FROM expired
            WHERE j.id = expired.id
            RETURNING j.id, expired.worker_id, j.attempt_count, j.state
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        for (job_id, worker_id, attempt, state) in &reclaimed {
            let worker_id = worker_id.as_deref().unwrap_or("-");
            if *state == JobState::Failed {
                warn!(job_id = %job_id, worker_id, attempt, "lease expired on final attempt, job failed");
            } else {
                info!(job_id = %job_id, worker_id, attempt, "lease expired, job re-queued");
            }
        }
        Ok(reclaimed.len())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM intake_jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn failed_jobs(&self) -> Result<Vec<Job>, QueueError> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM intake_jobs
            WHERE state = 'failed'
            ORDER BY finished_at ASC NULLS FIRST, id ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn retry(&self, job_id: JobId, reset_attempts: bool) -> Result<(), QueueError> {
        self.transition(job_id, None, |job| job.requeue(reset_attempts, Utc::now()))
            .await?;
        info!(job_id = %job_id, reset_attempts, "failed job re-queued");
        Ok(())
    }

    async fn retry_all_failed(&self) -> Result<usize, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE intake_jobs
            SET state = 'queued',
                worker_id = NULL,
                finished_at = NULL,
                run_at = NOW(),
                updated_at = NOW()
            WHERE state = 'failed'
            "#,
        )
        .execute(&self.pool)
        .await?;

        let requeued = result.rows_affected() as usize;
        info!(count = requeued, "failed jobs re-queued");
        Ok(requeued)
    }
}

/// PostgreSQL-backed worker registry.
///
/// The primary key on `name` makes registration atomic across processes.
#[derive(Clone)]
pub struct PostgresWorkerRegistry {
    pool: PgPool,
}

impl PostgresWorkerRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkerRegistry for PostgresWorkerRegistry {
    async fn register(&self, name: &str) -> Result<WorkerRegistration, RegistryError> {
        let registration = WorkerRegistration::new(name);

        let inserted = sqlx::query(
            r#"
            INSERT INTO worker_registrations (name, hostname, pid, registered_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(&registration.name)
        .bind(&registration.hostname)
        .bind(registration.pid)
        .bind(registration.registered_at)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(RegistryError::NameConflict(name.to_string()));
        }
        Ok(registration)
    }

    async fn deregister(&self, name: &str) -> Result<bool, RegistryError> {
        let result = sqlx::query("DELETE FROM worker_registrations WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear_all(&self) -> Result<usize, RegistryError> {
        let result = sqlx::query("DELETE FROM worker_registrations")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn list(&self) -> Result<Vec<WorkerRegistration>, RegistryError> {
        let workers = sqlx::query_as::<_, WorkerRegistration>(
            r#"
            SELECT name, hostname, pid, registered_at
            FROM worker_registrations
            ORDER BY registered_at ASC, name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(workers)
    }
}
