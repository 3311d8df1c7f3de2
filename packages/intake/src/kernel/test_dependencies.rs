// TestDependencies - mock collaborators for tests
//
// Stand-ins for the document renderer, the page rasterizer and the extraction
// service, so pipelines and workers can run without poppler or the network.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::render::{
    DocumentRenderer, PageImage, PageRange, PageRasterizer, RenderError, RenderedDocument,
};
use crate::domains::cases::models::ExtractionResult;
use crate::domains::extraction::{ExtractionAdapter, ExtractionError};
use crate::domains::ingestion::InboundMessage;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn fake_page(page_number: u32) -> PageImage {
    PageImage::new(page_number, "image/png", page_number.to_be_bytes().to_vec())
}

// =============================================================================
// Mock Rasterizer
// =============================================================================

/// Pretends every document has a fixed number of pages.
pub struct MockRasterizer {
    pages: u32,
    failing_page: Option<u32>,
    unreadable: bool,
    calls: Mutex<Vec<PageRange>>,
}

impl MockRasterizer {
    pub fn new(pages: u32) -> Self {
        Self {
            pages,
            failing_page: None,
            unreadable: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fail whichever chunk contains `page`.
    pub fn failing_at(mut self, page: u32) -> Self {
        self.failing_page = Some(page);
        self
    }

    /// Reject every document when counting pages.
    pub fn unreadable() -> Self {
        Self {
            unreadable: true,
            ..Self::new(0)
        }
    }

    /// Ranges passed to `rasterize`, in call order.
    pub fn calls(&self) -> Vec<PageRange> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl PageRasterizer for MockRasterizer {
    async fn page_count(&self, _document: &[u8]) -> Result<u32, RenderError> {
        if self.unreadable {
            return Err(RenderError::Unreadable(
                "Syntax Error: Couldn't read xref table".to_string(),
            ));
        }
        Ok(self.pages)
    }

    async fn rasterize(
        &self,
        _document: &[u8],
        range: PageRange,
    ) -> Result<Vec<PageImage>, RenderError> {
        lock(&self.calls).push(range);

        if let Some(page) = self.failing_page {
            if (range.first..=range.last).contains(&page) {
                return Err(RenderError::ChunkFailed {
                    range,
                    reason: format!("mock failure at page {page}"),
                });
            }
        }
        Ok((range.first..=range.last).map(fake_page).collect())
    }
}

// =============================================================================
// Mock Renderer
// =============================================================================

pub struct MockRenderer {
    result: Result<RenderedDocument, String>,
    calls: Mutex<usize>,
}

impl MockRenderer {
    /// Every document renders to `pages` pages.
    pub fn with_pages(pages: u32) -> Self {
        Self::returning(RenderedDocument {
            pages: (1..=pages).map(fake_page).collect(),
            ..RenderedDocument::empty()
        })
    }

    pub fn returning(document: RenderedDocument) -> Self {
        Self {
            result: Ok(document),
            calls: Mutex::new(0),
        }
    }

    /// Every document fails with [`RenderError::Unreadable`].
    pub fn unreadable(reason: impl Into<String>) -> Self {
        Self {
            result: Err(reason.into()),
            calls: Mutex::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        *lock(&self.calls)
    }
}

#[async_trait]
impl DocumentRenderer for MockRenderer {
    async fn render(&self, _document: &[u8]) -> Result<RenderedDocument, RenderError> {
        *lock(&self.calls) += 1;
        self.result.clone().map_err(RenderError::Unreadable)
    }
}

// =============================================================================
// Mock Extraction Adapter
// =============================================================================

/// Arguments captured from an extract call
#[derive(Debug, Clone)]
pub struct ExtractionCall {
    pub subject: String,
    pub images: usize,
}

/// Replays queued extraction results, then falls back to a fixed one.
pub struct MockExtractionAdapter {
    responses: Mutex<VecDeque<Result<ExtractionResult, ExtractionError>>>,
    fallback: Option<ExtractionResult>,
    delay: Option<Duration>,
    calls: Mutex<Vec<ExtractionCall>>,
}

impl Default for MockExtractionAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExtractionAdapter {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            fallback: None,
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Add a result to the queue
    pub fn with_result(self, result: ExtractionResult) -> Self {
        lock(&self.responses).push_back(Ok(result));
        self
    }

    /// Add an error to the queue
    pub fn with_error(self, error: ExtractionError) -> Self {
        lock(&self.responses).push_back(Err(error));
        self
    }

    /// Returned once the queue is drained.
    pub fn always(mut self, result: ExtractionResult) -> Self {
        self.fallback = Some(result);
        self
    }

    /// Sleep before answering, to widen race windows in tests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<ExtractionCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

#[async_trait]
impl ExtractionAdapter for MockExtractionAdapter {
    async fn extract(
        &self,
        message: &InboundMessage,
        images: &[PageImage],
    ) -> Result<ExtractionResult, ExtractionError> {
        lock(&self.calls).push(ExtractionCall {
            subject: message.subject.clone(),
            images: images.len(),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let queued = lock(&self.responses).pop_front();
        match queued {
            Some(response) => response,
            None => self.fallback.clone().ok_or_else(|| {
                ExtractionError::Unavailable("no mock extraction queued".to_string())
            }),
        }
    }
}
