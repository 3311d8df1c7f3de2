//! Job worker service for processing queued jobs.
//!
//! The `JobWorker` is a long-running loop that:
//! - Registers its name with the [`WorkerRegistry`] (a taken name is fatal)
//! - Polls the [`JobQueue`] for the next eligible job
//! - Hands the job to its [`JobHandler`], one job at a time
//! - Marks the job finished or failed, including when the handler panics
//! - Deregisters on graceful shutdown
//!
//! # Architecture
//!
//! ```text
//! JobWorker
//!     │
//!     ├─► registry.register(name)
//!     ├─► loop: queue.dequeue(name)
//!     │       └─► handler.handle(&job)
//!     │               ├─ Ok        ─► queue.complete
//!     │               ├─ Err(f)    ─► queue.fail(f.kind)
//!     │               └─ panic     ─► queue.fail(NonRetryable)
//!     └─► registry.deregister(name)
//! ```
//!
//! Shutdown is checked between jobs; a job in flight runs to completion.
//! If the job's lease ran out in the meantime (re-queued, or claimed by
//! another worker), the result is discarded.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job::{ErrorKind, FailOutcome, Job, JobFailure};
use super::queue::{JobQueue, QueueError};
use super::registry::{RegistryError, WorkerRegistry};

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// Worker name, unique among running workers
    pub worker_id: String,
    /// How long to wait when no jobs are available
    pub poll_interval: Duration,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-dev".to_string(),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl JobWorkerConfig {
    /// Create a new config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// Executes one claimed job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), JobFailure>;
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("worker task crashed: {0}")]
    Crashed(String),
}

/// Counters reported when a worker stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
}

/// A worker that processes jobs from a queue.
pub struct JobWorker {
    queue: Arc<dyn JobQueue>,
    registry: Arc<dyn WorkerRegistry>,
    handler: Arc<dyn JobHandler>,
    config: JobWorkerConfig,
}

impl JobWorker {
    /// Create a new job worker.
    pub fn new(
        queue: Arc<dyn JobQueue>,
        registry: Arc<dyn WorkerRegistry>,
        handler: Arc<dyn JobHandler>,
        config: JobWorkerConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            handler,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Fails immediately with [`RegistryError::NameConflict`] if another
    /// worker holds this name.
    pub async fn run(self, shutdown: CancellationToken) -> Result<WorkerStats, WorkerError> {
        let worker_id = self.config.worker_id.clone();

        self.registry.register(&worker_id).await.map_err(|e| {
            error!(worker_id = %worker_id, error = %e, "worker registration failed");
            e
        })?;

        info!(
            worker_id = %worker_id,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "job worker starting"
        );

        let mut stats = WorkerStats::default();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.queue.dequeue(&worker_id).await {
                Ok(Some(job)) => self.process_job(job, &mut stats).await,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(worker_id = %worker_id, error = %e, "failed to dequeue job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        if let Err(e) = self.registry.deregister(&worker_id).await {
            warn!(worker_id = %worker_id, error = %e, "failed to deregister worker");
        }

        info!(
            worker_id = %worker_id,
            processed = stats.processed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            "job worker stopped"
        );
        Ok(stats)
    }

    /// Process a single claimed job.
    async fn process_job(&self, job: Job, stats: &mut WorkerStats) {
        let job_id = job.id;
        let job_type = job.job_type.clone();
        let lease = job.lease();
        stats.processed += 1;

        debug!(job_id = %job_id, job_type = %job_type, attempt = job.attempt_count, "job started");

        let result = AssertUnwindSafe(self.handler.handle(&job))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(JobFailure::non_retryable(format!(
                    "job handler panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });

        match result {
            Ok(()) => match self.queue.complete(&lease).await {
                Ok(()) => {
                    debug!(job_id = %job_id, job_type = %job_type, "job succeeded");
                    stats.succeeded += 1;
                }
                Err(e) if is_stale_claim(&e) => {
                    warn!(job_id = %job_id, error = %e, "job no longer held by this worker, result discarded");
                }
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "failed to mark job as finished");
                }
            },
            Err(failure) => {
                match self
                    .queue
                    .fail(&lease, &failure.message, failure.kind)
                    .await
                {
                    Ok(FailOutcome::Retrying { run_at }) => {
                        stats.retried += 1;
                        warn!(
                            job_id = %job_id,
                            job_type = %job_type,
                            attempt = job.attempt_count,
                            retry_at = %run_at,
                            error = %failure,
                            "job failed, will retry"
                        );
                    }
                    Ok(FailOutcome::Failed) => {
                        stats.failed += 1;
                        error!(
                            job_id = %job_id,
                            job_type = %job_type,
                            attempt = job.attempt_count,
                            retryable = failure.kind == ErrorKind::Retryable,
                            error = %failure,
                            "job failed permanently"
                        );
                    }
                    Err(e) if is_stale_claim(&e) => {
                        warn!(
                            job_id = %job_id,
                            error = %failure,
                            queue_error = %e,
                            "job no longer held by this worker, failure discarded"
                        );
                    }
                    Err(e) => {
                        error!(job_id = %job_id, error = %e, "failed to mark job as failed");
                    }
                }
            }
        }
    }
}

/// The lease ran out and the job was re-queued, reclaimed by another
/// worker, or already finished.
fn is_stale_claim(e: &QueueError) -> bool {
    matches!(
        e,
        QueueError::LeaseLost { .. } | QueueError::InvalidTransition { .. }
    )
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
