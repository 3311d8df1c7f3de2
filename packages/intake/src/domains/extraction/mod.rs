//! Extraction boundary: inbound message plus page images in, structured
//! [`ExtractionResult`] out.
//!
//! The engine only sees [`ExtractionAdapter`]. [`OpenAiExtractionAdapter`]
//! is the production implementation; tests use
//! [`MockExtractionAdapter`](crate::kernel::MockExtractionAdapter).

mod openai;
pub mod prompts;

use async_trait::async_trait;
use thiserror::Error;

use crate::domains::cases::models::ExtractionResult;
use crate::domains::ingestion::InboundMessage;
use crate::kernel::PageImage;

pub use openai::{AttachmentResponse, CaseExtractionResponse, OpenAiExtractionAdapter};

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("extraction service unavailable: {0}")]
    Unavailable(String),

    #[error("malformed extraction response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait ExtractionAdapter: Send + Sync {
    /// `images` are the rendered pages of the message's documents, in
    /// attachment then page order.
    async fn extract(
        &self,
        message: &InboundMessage,
        images: &[PageImage],
    ) -> Result<ExtractionResult, ExtractionError>;
}
