//! Builders shared by the integration tests.

use std::sync::Arc;
use std::time::Duration;

use intake_core::domains::cases::{
    CaseReconciler, ExtractionResult, IdentifyingFields, MemoryCaseStore, OptionalFields,
};
use intake_core::domains::extraction::ExtractionAdapter;
use intake_core::domains::ingestion::{Attachment, InboundMessage, IngestionPipeline, IntakeService};
use intake_core::kernel::jobs::{
    JobHandler, JobWorker, JobWorkerConfig, MemoryJobQueue, MemoryWorkerRegistry, QueueConfig,
    QueueStatus, RetryPolicy,
};
use intake_core::kernel::DocumentRenderer;

/// Extraction for `case` with the identifying fields every scenario shares.
pub fn extraction(case: &str, confidence: f64, optional: OptionalFields) -> ExtractionResult {
    ExtractionResult::builder()
        .identifying(IdentifyingFields::new(case, "Doe", "Ortho"))
        .optional(optional)
        .confidence(confidence)
        .build()
}

pub fn exam_on(date: &str) -> OptionalFields {
    OptionalFields::builder().exam_date(date).build()
}

pub fn referral_email(subject: &str) -> InboundMessage {
    InboundMessage::new(subject, "adjuster@insurer.example", "Please schedule an IME.")
}

pub fn referral_with_pdf(subject: &str) -> InboundMessage {
    referral_email(subject).with_attachment(Attachment::pdf("referral.pdf", b"%PDF-1.7".to_vec()))
}

/// Queue settings with millisecond backoff so retry tests finish quickly.
pub fn fast_queue_config() -> QueueConfig {
    QueueConfig {
        retry: RetryPolicy {
            base: Duration::from_millis(10),
            cap: Duration::from_millis(200),
        },
        ..QueueConfig::default()
    }
}

/// The engine wired to in-memory backends.
pub struct MemoryEngine {
    pub queue: Arc<MemoryJobQueue>,
    pub registry: Arc<MemoryWorkerRegistry>,
    pub store: Arc<MemoryCaseStore>,
    pub reconciler: Arc<CaseReconciler>,
    pub service: IntakeService,
}

impl MemoryEngine {
    pub fn new(config: QueueConfig) -> Self {
        let queue = Arc::new(MemoryJobQueue::new(config));
        let registry = Arc::new(MemoryWorkerRegistry::new());
        let store = Arc::new(MemoryCaseStore::new());
        let reconciler = Arc::new(CaseReconciler::new(store.clone()));
        let service = IntakeService::new(queue.clone(), registry.clone(), store.clone());

        Self {
            queue,
            registry,
            store,
            reconciler,
            service,
        }
    }

    pub fn pipeline(
        &self,
        renderer: impl DocumentRenderer + 'static,
        extractor: Arc<dyn ExtractionAdapter>,
    ) -> Arc<IngestionPipeline> {
        Arc::new(IngestionPipeline::new(
            Arc::new(renderer),
            extractor,
            self.reconciler.clone(),
        ))
    }

    pub fn worker(&self, name: &str, handler: Arc<dyn JobHandler>) -> JobWorker {
        JobWorker::new(
            self.queue.clone(),
            self.registry.clone(),
            handler,
            worker_config(name),
        )
    }
}

pub fn worker_config(name: &str) -> JobWorkerConfig {
    JobWorkerConfig {
        worker_id: name.to_string(),
        poll_interval: Duration::from_millis(5),
    }
}

/// Poll queue counts until `done` holds or five seconds pass.
pub async fn wait_for_jobs(service: &IntakeService, done: impl Fn(&QueueStatus) -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if let Ok(status) = service.status().await {
            if done(&status.jobs) {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
