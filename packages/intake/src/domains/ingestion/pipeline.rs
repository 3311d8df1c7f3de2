//! One message, start to finish: render, extract, reconcile.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::message::{InboundMessage, ProcessMessage};
use crate::domains::cases::activities::MergeOutcome;
use crate::domains::cases::models::{CaseKey, OptionalField, ReviewRecommendation};
use crate::domains::cases::reconciler::CaseReconciler;
use crate::domains::extraction::ExtractionAdapter;
use crate::error::{IntakeError, Result};
use crate::kernel::jobs::{Job, JobFailure, JobHandler};
use crate::kernel::{DocumentRenderer, PageImage, PageRange};

/// What processing one message did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestionOutcome {
    pub case_key: CaseKey,
    pub outcome: MergeOutcome,
    pub review: ReviewRecommendation,
    pub conflicts: usize,
    pub missing_critical: Vec<OptionalField>,
    pub pages: usize,
    /// Ranges lost to a lenient render; empty under the strict policy
    pub failed_ranges: Vec<PageRange>,
}

pub struct IngestionPipeline {
    renderer: Arc<dyn DocumentRenderer>,
    extractor: Arc<dyn ExtractionAdapter>,
    reconciler: Arc<CaseReconciler>,
    pdf_conversion_enabled: bool,
}

impl IngestionPipeline {
    pub fn new(
        renderer: Arc<dyn DocumentRenderer>,
        extractor: Arc<dyn ExtractionAdapter>,
        reconciler: Arc<CaseReconciler>,
    ) -> Self {
        Self {
            renderer,
            extractor,
            reconciler,
            pdf_conversion_enabled: true,
        }
    }

    /// With conversion off, PDFs reach extraction by name only.
    pub fn with_pdf_conversion(mut self, enabled: bool) -> Self {
        self.pdf_conversion_enabled = enabled;
        self
    }

    pub fn reconciler(&self) -> &Arc<CaseReconciler> {
        &self.reconciler
    }

    pub async fn process(&self, message: &InboundMessage) -> Result<IngestionOutcome> {
        let (images, failed_ranges) = self.render_attachments(message).await?;

        let extraction = self.extractor.extract(message, &images).await?;
        debug!(
            case_number = %extraction.identifying.case_number,
            confidence = extraction.confidence,
            "extraction received"
        );

        let reconciliation = self.reconciler.apply(&extraction).await?;

        Ok(IngestionOutcome {
            case_key: reconciliation.case.case_key.clone(),
            outcome: reconciliation.outcome,
            review: extraction.review(),
            conflicts: reconciliation.conflicts.len(),
            missing_critical: reconciliation.missing.critical.clone(),
            pages: images.len(),
            failed_ranges,
        })
    }

    async fn render_attachments(
        &self,
        message: &InboundMessage,
    ) -> Result<(Vec<PageImage>, Vec<PageRange>)> {
        let mut images = Vec::new();
        let mut failed_ranges = Vec::new();

        for attachment in &message.attachments {
            let Some(data) = attachment.data.as_deref() else {
                continue;
            };

            if attachment.is_pdf() {
                if !self.pdf_conversion_enabled {
                    debug!(filename = %attachment.filename, "pdf conversion disabled, skipping render");
                    continue;
                }
                let rendered = self.renderer.render(data).await.map_err(|e| {
                    warn!(filename = %attachment.filename, error = %e, "attachment failed to render");
                    IntakeError::from(e)
                })?;
                if rendered.partial {
                    warn!(
                        filename = %attachment.filename,
                        failed = ?rendered.failed_ranges,
                        "attachment rendered partially"
                    );
                }
                images.extend(rendered.pages);
                failed_ranges.extend(rendered.failed_ranges);
            } else if attachment.is_image() {
                let mime_type = attachment.content_type.as_deref().unwrap_or("image/png");
                images.push(PageImage::new(1, mime_type, data.to_vec()));
            }
        }

        Ok((images, failed_ranges))
    }
}

#[async_trait]
impl JobHandler for IngestionPipeline {
    async fn handle(&self, job: &Job) -> std::result::Result<(), JobFailure> {
        if job.job_type != ProcessMessage::JOB_TYPE {
            return Err(IntakeError::Payload(format!("unknown job type: {}", job.job_type)).into());
        }

        let command: ProcessMessage = job
            .deserialize_payload()
            .map_err(|e| IntakeError::Payload(e.to_string()))?;

        let outcome = self.process(&command.message).await?;
        info!(
            job_id = %job.id,
            case_key = %outcome.case_key,
            outcome = ?outcome.outcome,
            review = %outcome.review,
            pages = outcome.pages,
            "message processed"
        );
        Ok(())
    }
}
