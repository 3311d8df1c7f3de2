//! Kernel module - infrastructure shared by the domains.
//!
//! The job queue moves opaque payloads and the renderer turns document bytes
//! into page images; neither knows about cases. `test_dependencies` holds the
//! mock collaborators used by unit and integration tests.

pub mod jobs;
pub mod render;
pub mod test_dependencies;

pub use render::{
    ChunkedRenderer, DocumentRenderer, ImageFormat, PageImage, PageRange, PageRasterizer,
    PopplerRasterizer, RenderConfig, RenderError, RenderPolicy, RenderedDocument,
};
pub use test_dependencies::{ExtractionCall, MockExtractionAdapter, MockRasterizer, MockRenderer};
