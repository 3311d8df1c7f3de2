//! A set of [`JobWorker`]s sharing one shutdown signal.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::queue::JobQueue;
use super::registry::WorkerRegistry;
use super::worker::{JobHandler, JobWorker, JobWorkerConfig, WorkerError, WorkerStats};

/// How a worker task ended.
#[derive(Debug)]
pub struct WorkerExit {
    pub worker_id: String,
    pub result: Result<WorkerStats, WorkerError>,
}

/// Runs workers as tokio tasks until shut down.
pub struct WorkerPool {
    shutdown: CancellationToken,
    tasks: JoinSet<WorkerExit>,
}

impl WorkerPool {
    /// Spawn each worker on its own task.
    pub fn spawn(workers: Vec<JobWorker>) -> Self {
        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();

        for worker in workers {
            let token = shutdown.child_token();
            tasks.spawn(async move {
                let worker_id = worker.worker_id().to_string();
                let result = worker.run(token).await;
                WorkerExit { worker_id, result }
            });
        }

        info!(workers = tasks.len(), "worker pool started");
        Self { shutdown, tasks }
    }

    /// Spawn `concurrency` workers over the same queue and handler.
    ///
    /// `config.worker_id` is the name prefix: workers are named
    /// `<worker_id>-1`, `<worker_id>-2`, ... even when there is only one.
    pub fn start(
        concurrency: usize,
        queue: Arc<dyn JobQueue>,
        registry: Arc<dyn WorkerRegistry>,
        handler: Arc<dyn JobHandler>,
        config: JobWorkerConfig,
    ) -> Self {
        let workers = (1..=concurrency.max(1))
            .map(|n| {
                let worker_id = format!("{}-{}", config.worker_id, n);
                JobWorker::new(
                    queue.clone(),
                    registry.clone(),
                    handler.clone(),
                    JobWorkerConfig {
                        worker_id,
                        ..config.clone()
                    },
                )
            })
            .collect();

        Self::spawn(workers)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for the next worker to stop on its own (e.g. a name conflict).
    ///
    /// Returns `None` once every worker has exited.
    pub async fn join_next(&mut self) -> Option<WorkerExit> {
        let joined = self.tasks.join_next().await?;
        Some(joined.unwrap_or_else(|e| WorkerExit {
            worker_id: "unknown".to_string(),
            result: Err(WorkerError::Crashed(e.to_string())),
        }))
    }

    /// Signal every worker to stop after its current job and wait for them.
    pub async fn shutdown(mut self) -> Vec<WorkerExit> {
        self.shutdown.cancel();

        let mut exits = Vec::with_capacity(self.tasks.len());
        while let Some(exit) = self.join_next().await {
            if let Err(e) = &exit.result {
                warn!(worker_id = %exit.worker_id, error = %e, "worker exited with error");
            }
            exits.push(exit);
        }

        info!(workers = exits.len(), "worker pool stopped");
        exits
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::kernel::jobs::{
        Job, JobFailure, JobState, MemoryJobQueue, MemoryWorkerRegistry, NewJob,
    };

    struct NoopHandler;

    #[async_trait]
    impl JobHandler for NoopHandler {
        async fn handle(&self, _job: &Job) -> Result<(), JobFailure> {
            Ok(())
        }
    }

    fn config() -> JobWorkerConfig {
        JobWorkerConfig {
            worker_id: "worker-test".to_string(),
            poll_interval: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_deregisters() {
        let queue = Arc::new(MemoryJobQueue::default());
        let registry = Arc::new(MemoryWorkerRegistry::new());

        for _ in 0..6 {
            queue
                .enqueue(NewJob::new("process_message", serde_json::json!({})))
                .await
                .unwrap();
        }

        let pool = WorkerPool::start(3, queue.clone(), registry.clone(), Arc::new(NoopHandler), config());
        assert_eq!(pool.len(), 3);

        for _ in 0..400 {
            if queue.status().await.unwrap().finished == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let exits = pool.shutdown().await;
        let processed: u64 = exits
            .iter()
            .map(|e| e.result.as_ref().unwrap().processed)
            .sum();

        assert_eq!(processed, 6);
        assert!(queue.jobs().iter().all(|j| j.state == JobState::Finished));
        assert_eq!(registry.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pool_names_workers() {
        let queue = Arc::new(MemoryJobQueue::default());
        let registry = Arc::new(MemoryWorkerRegistry::new());

        let pool = WorkerPool::start(2, queue, registry.clone(), Arc::new(NoopHandler), config());

        let mut names = Vec::new();
        for _ in 0..400 {
            names = registry
                .list()
                .await
                .unwrap()
                .into_iter()
                .map(|w| w.name)
                .collect();
            if names.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(names, vec!["worker-test-1", "worker-test-2"]);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_single_worker_is_still_indexed() {
        let queue = Arc::new(MemoryJobQueue::default());
        let registry = Arc::new(MemoryWorkerRegistry::new());

        let pool = WorkerPool::start(1, queue, registry.clone(), Arc::new(NoopHandler), config());

        let mut names = Vec::new();
        for _ in 0..400 {
            names = registry
                .list()
                .await
                .unwrap()
                .into_iter()
                .map(|w| w.name)
                .collect();
            if !names.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(names, vec!["worker-test-1"]);

        let exits = pool.shutdown().await;
        assert_eq!(exits[0].worker_id, "worker-test-1");
    }

    #[tokio::test]
    async fn test_conflicting_worker_exits_early() {
        let queue = Arc::new(MemoryJobQueue::default());
        let registry = Arc::new(MemoryWorkerRegistry::new());
        registry.register("worker-test-1").await.unwrap();

        let mut pool = WorkerPool::start(1, queue, registry, Arc::new(NoopHandler), config());

        let exit = pool.join_next().await.unwrap();
        assert_eq!(exit.worker_id, "worker-test-1");
        assert!(exit.result.is_err());
        assert!(pool.join_next().await.is_none());
    }
}
