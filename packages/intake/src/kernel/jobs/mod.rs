//! Job infrastructure for background ingestion.
//!
//! This module provides the kernel-level infrastructure for job execution:
//! - [`JobQueue`] - Queue contract, with [`MemoryJobQueue`] and [`PostgresJobQueue`]
//! - [`WorkerRegistry`] - Unique worker names, in memory or Postgres
//! - [`JobWorker`] - Long-running loop that claims and executes jobs
//! - [`WorkerPool`] - Several workers sharing one shutdown signal
//! - [`Job`] - Job model and its state machine
//!
//! # Architecture
//!
//! ```text
//! IntakeService.submit(message)
//!     │
//!     └─► JobQueue.enqueue()  (state = queued)
//!
//! JobWorker (one per registered name)
//!     │
//!     ├─► JobQueue.dequeue()  (queued -> started, lease taken)
//!     ├─► JobHandler.handle(&job)
//!     └─► complete / fail     (finished | queued with backoff | failed)
//!             fenced by the Lease from dequeue; a reclaimed job rejects
//!             the old holder with LeaseLost
//! ```
//!
//! Domain-specific handlers live in their domains; this module only provides
//! the infrastructure.

mod job;
mod memory;
mod pool;
mod postgres;
mod queue;
mod registry;
mod worker;

pub use job::{ErrorKind, FailOutcome, Job, JobFailure, JobState, Lease, DEFAULT_MAX_ATTEMPTS};
pub use memory::{MemoryJobQueue, MemoryWorkerRegistry};
pub use pool::{WorkerExit, WorkerPool};
pub use postgres::{PostgresJobQueue, PostgresWorkerRegistry};
pub use queue::{
    CommandMeta, JobQueue, JobQueueExt, NewJob, QueueConfig, QueueError, QueueStatus, RetryPolicy,
};
pub use registry::{RegistryError, WorkerRegistration, WorkerRegistry};
pub use worker::{JobHandler, JobWorker, JobWorkerConfig, WorkerError, WorkerStats};
