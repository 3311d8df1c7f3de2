pub mod message;
pub mod pipeline;
pub mod service;

pub use message::{Attachment, InboundMessage, ProcessMessage};
pub use pipeline::{IngestionOutcome, IngestionPipeline};
pub use service::{IntakeService, IntakeStatus};
