//! Operator-facing surface of the engine.
//!
//! Submitting a message only enqueues it; workers do the processing. The
//! remaining operations inspect and repair queue state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::message::{InboundMessage, ProcessMessage};
use crate::common::JobId;
use crate::domains::cases::models::{CanonicalCase, CaseKey};
use crate::domains::cases::store::CaseStore;
use crate::error::{IntakeError, Result};
use crate::kernel::jobs::{Job, JobQueue, JobQueueExt, QueueStatus, WorkerRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IntakeStatus {
    pub jobs: QueueStatus,
    pub workers: usize,
}

#[derive(Clone)]
pub struct IntakeService {
    queue: Arc<dyn JobQueue>,
    registry: Arc<dyn WorkerRegistry>,
    cases: Arc<dyn CaseStore>,
}

impl IntakeService {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        registry: Arc<dyn WorkerRegistry>,
        cases: Arc<dyn CaseStore>,
    ) -> Self {
        Self {
            queue,
            registry,
            cases,
        }
    }

    /// Enqueue a message for immediate processing.
    pub async fn submit(&self, message: InboundMessage) -> Result<JobId> {
        let command = Self::command(message);
        let id = self.queue.enqueue_command(&command).await?;
        info!(job_id = %id, subject = %command.message.subject, "message submitted");
        Ok(id)
    }

    /// Enqueue a message that becomes eligible at `run_at`.
    pub async fn submit_at(&self, message: InboundMessage, run_at: DateTime<Utc>) -> Result<JobId> {
        let command = Self::command(message);
        let id = self.queue.schedule_command(&command, run_at).await?;
        info!(job_id = %id, run_at = %run_at, "message scheduled");
        Ok(id)
    }

    fn command(mut message: InboundMessage) -> ProcessMessage {
        message.received_at.get_or_insert_with(Utc::now);
        ProcessMessage { message }
    }

    pub async fn status(&self) -> Result<IntakeStatus> {
        Ok(IntakeStatus {
            jobs: self.queue.status().await?,
            workers: self.registry.count().await?,
        })
    }

    /// Remove every worker registration. Only safe once no worker is running.
    pub async fn clear_worker_registrations(&self) -> Result<usize> {
        let cleared = self.registry.clear_all().await?;
        warn!(cleared, "cleared all worker registrations");
        Ok(cleared)
    }

    /// Re-queue one failed job. Its attempt count is kept unless
    /// `reset_attempts` is set.
    pub async fn retry_job(&self, id: JobId, reset_attempts: bool) -> Result<()> {
        self.queue.retry(id, reset_attempts).await?;
        info!(job_id = %id, reset_attempts, "job re-queued");
        Ok(())
    }

    pub async fn retry_all_failed(&self) -> Result<usize> {
        let count = self.queue.retry_all_failed().await?;
        info!(count, "failed jobs re-queued");
        Ok(count)
    }

    pub async fn failed_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.queue.failed_jobs().await?)
    }

    pub async fn job(&self, id: JobId) -> Result<Job> {
        self.queue
            .get(id)
            .await?
            .ok_or(IntakeError::JobNotFound(id))
    }

    /// Look up a case by case number, normalized the same way merges are.
    pub async fn case(&self, case_number: &str) -> Result<Option<CanonicalCase>> {
        Ok(self.cases.find(&CaseKey::normalize(case_number)).await?)
    }

    pub async fn cases(&self) -> Result<Vec<CanonicalCase>> {
        Ok(self.cases.list().await?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::domains::cases::store::MemoryCaseStore;
    use crate::kernel::jobs::{
        ErrorKind, JobState, MemoryJobQueue, MemoryWorkerRegistry, QueueConfig,
    };

    fn service() -> (IntakeService, Arc<MemoryJobQueue>, Arc<MemoryWorkerRegistry>) {
        let queue = Arc::new(MemoryJobQueue::new(QueueConfig::default()));
        let registry = Arc::new(MemoryWorkerRegistry::new());
        let service = IntakeService::new(
            queue.clone(),
            registry.clone(),
            Arc::new(MemoryCaseStore::new()),
        );
        (service, queue, registry)
    }

    #[tokio::test]
    async fn test_submit_stamps_received_at() {
        let (service, queue, _) = service();
        let id = service
            .submit(InboundMessage::new("Referral", "a@b.c", "body"))
            .await
            .unwrap();

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.job_type, "process_message");
        assert_eq!(job.state, JobState::Queued);

        let command: ProcessMessage = job.deserialize_payload().unwrap();
        assert!(command.message.received_at.is_some());
    }

    #[tokio::test]
    async fn test_submit_at_is_scheduled() {
        let (service, _, _) = service();
        service
            .submit_at(
                InboundMessage::new("Referral", "a@b.c", "body"),
                Utc::now() + Duration::hours(1),
            )
            .await
            .unwrap();

        let status = service.status().await.unwrap();
        assert_eq!(status.jobs.scheduled, 1);
        assert_eq!(status.jobs.queued, 0);
    }

    #[tokio::test]
    async fn test_status_counts_workers() {
        let (service, _, registry) = service();
        registry.register("worker-a").await.unwrap();
        registry.register("worker-b").await.unwrap();

        assert_eq!(service.status().await.unwrap().workers, 2);
        assert_eq!(service.clear_worker_registrations().await.unwrap(), 2);
        assert_eq!(service.status().await.unwrap().workers, 0);
    }

    #[tokio::test]
    async fn test_retry_job_keeps_attempts_unless_reset() {
        let (service, queue, _) = service();
        let id = service
            .submit(InboundMessage::new("Referral", "a@b.c", "body"))
            .await
            .unwrap();

        let job = queue.dequeue("worker-a").await.unwrap().unwrap();
        queue
            .fail(&job.lease(), "bad input", ErrorKind::NonRetryable)
            .await
            .unwrap();
        assert_eq!(service.failed_jobs().await.unwrap().len(), 1);

        service.retry_job(id, false).await.unwrap();
        assert_eq!(service.job(id).await.unwrap().attempt_count, 1);

        let job = queue.dequeue("worker-a").await.unwrap().unwrap();
        queue
            .fail(&job.lease(), "bad input", ErrorKind::NonRetryable)
            .await
            .unwrap();
        service.retry_job(id, true).await.unwrap();

        let job = service.job(id).await.unwrap();
        assert_eq!(job.attempt_count, 0);
        assert_eq!(job.state, JobState::Queued);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let (service, _, _) = service();
        assert!(matches!(
            service.job(JobId::new()).await,
            Err(IntakeError::JobNotFound(_))
        ));
        assert!(matches!(
            service.retry_job(JobId::new(), false).await,
            Err(IntakeError::JobNotFound(_))
        ));
    }
}
