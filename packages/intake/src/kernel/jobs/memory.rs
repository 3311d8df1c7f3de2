//! In-process job queue and worker registry.
//!
//! Used by tests and single-process deployments. Both types share the
//! [`Job`] state machine with the Postgres backend, so behavior matches.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::job::{ErrorKind, FailOutcome, Job, JobState, Lease};
use super::queue::{JobQueue, NewJob, QueueConfig, QueueError, QueueStatus};
use super::registry::{RegistryError, WorkerRegistration, WorkerRegistry};
use crate::common::JobId;

#[derive(Default)]
struct QueueState {
    jobs: BTreeMap<JobId, Job>,
    closed: bool,
}

/// Job queue held in process memory.
pub struct MemoryJobQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl MemoryJobQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Make every subsequent operation fail with [`QueueError::Unavailable`].
    pub fn close(&self) {
        self.lock().closed = true;
    }

    /// Undo [`close`](Self::close).
    pub fn reopen(&self) {
        self.lock().closed = false;
    }

    /// Snapshot of every job, in id order.
    pub fn jobs(&self) -> Vec<Job> {
        self.lock().jobs.values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open(&self) -> Result<MutexGuard<'_, QueueState>, QueueError> {
        let state = self.lock();
        if state.closed {
            return Err(QueueError::Unavailable("memory queue is closed".into()));
        }
        Ok(state)
    }

    fn insert(&self, job: NewJob, run_at: DateTime<Utc>) -> Result<JobId, QueueError> {
        let mut state = self.open()?;
        let job = job.into_job(&self.config, run_at);
        let id = job.id;
        debug!(job_id = %id, job_type = %job.job_type, run_at = %run_at, "job enqueued");
        state.jobs.insert(id, job);
        Ok(id)
    }
}

fn reclaim(state: &mut QueueState, now: DateTime<Utc>) -> usize {
    let mut reclaimed = 0;
    for job in state.jobs.values_mut().filter(|j| j.lease_expired(now)) {
        let worker_id = job.worker_id.clone().unwrap_or_else(|| "-".to_string());
        match job.reclaim(now) {
            FailOutcome::Retrying { .. } => info!(
                job_id = %job.id,
                worker_id = %worker_id,
                attempt = job.attempt_count,
                "lease expired, job re-queued"
            ),
            FailOutcome::Failed => warn!(
                job_id = %job.id,
                worker_id = %worker_id,
                attempt = job.attempt_count,
                "lease expired on final attempt, job failed"
            ),
        }
        reclaimed += 1;
    }
    reclaimed
}

fn job_mut(state: &mut QueueState, job_id: JobId) -> Result<&mut Job, QueueError> {
    state
        .jobs
        .get_mut(&job_id)
        .ok_or(QueueError::NotFound(job_id))
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, QueueError> {
        self.insert(job, Utc::now())
    }

    async fn schedule(&self, job: NewJob, run_at: DateTime<Utc>) -> Result<JobId, QueueError> {
        self.insert(job, run_at)
    }

    async fn dequeue(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        let mut state = self.open()?;
        let now = Utc::now();
        reclaim(&mut state, now);

        let next = state
            .jobs
            .values()
            .filter(|j| j.is_eligible(now))
            .min_by_key(|j| (j.run_at, j.id))
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };

        let job = job_mut(&mut state, id)?;
        job.start(worker_id, self.config.job_timeout, now);
        Ok(Some(job.clone()))
    }

    async fn complete(&self, lease: &Lease) -> Result<(), QueueError> {
        let mut state = self.open()?;
        job_mut(&mut state, lease.job_id)?.finish(lease, Utc::now())
    }

    async fn fail(
        &self,
        lease: &Lease,
        error: &str,
        kind: ErrorKind,
    ) -> Result<FailOutcome, QueueError> {
        let mut state = self.open()?;
        job_mut(&mut state, lease.job_id)?.fail(
            lease,
            error,
            kind,
            &self.config.retry,
            Utc::now(),
        )
    }

    async fn status(&self) -> Result<QueueStatus, QueueError> {
        let mut state = self.open()?;
        let now = Utc::now();
        reclaim(&mut state, now);

        let mut status = QueueStatus::default();
        for job in state.jobs.values() {
            status.count(job, now);
        }
        Ok(status)
    }

    async fn reclaim_expired(&self) -> Result<usize, QueueError> {
        let mut state = self.open()?;
        Ok(reclaim(&mut state, Utc::now()))
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.open()?.jobs.get(&job_id).cloned())
    }

    async fn failed_jobs(&self) -> Result<Vec<Job>, QueueError> {
        let state = self.open()?;
        let mut failed: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.state == JobState::Failed)
            .cloned()
            .collect();
        failed.sort_by_key(|j| (j.finished_at, j.id));
        Ok(failed)
    }

    async fn retry(&self, job_id: JobId, reset_attempts: bool) -> Result<(), QueueError> {
        let mut state = self.open()?;
        job_mut(&mut state, job_id)?.requeue(reset_attempts, Utc::now())
    }

    async fn retry_all_failed(&self) -> Result<usize, QueueError> {
        let mut state = self.open()?;
        let now = Utc::now();
        let mut requeued = 0;
        for job in state
            .jobs
            .values_mut()
            .filter(|j| j.state == JobState::Failed)
        {
            job.requeue(false, now)?;
            requeued += 1;
        }
        Ok(requeued)
    }
}

/// Worker registry held in process memory.
#[derive(Default)]
pub struct MemoryWorkerRegistry {
    workers: Mutex<BTreeMap<String, WorkerRegistration>>,
}

impl MemoryWorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, WorkerRegistration>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl WorkerRegistry for MemoryWorkerRegistry {
    async fn register(&self, name: &str) -> Result<WorkerRegistration, RegistryError> {
        let mut workers = self.lock();
        if workers.contains_key(name) {
            return Err(RegistryError::NameConflict(name.to_string()));
        }
        let registration = WorkerRegistration::new(name);
        workers.insert(name.to_string(), registration.clone());
        Ok(registration)
    }

    async fn deregister(&self, name: &str) -> Result<bool, RegistryError> {
        Ok(self.lock().remove(name).is_some())
    }

    async fn clear_all(&self) -> Result<usize, RegistryError> {
        let mut workers = self.lock();
        let cleared = workers.len();
        workers.clear();
        Ok(cleared)
    }

    async fn list(&self) -> Result<Vec<WorkerRegistration>, RegistryError> {
        Ok(self.lock().values().cloned().collect())
    }
}
