//! Document rendering: document bytes in, ordered page images out.
//!
//! [`ChunkedRenderer`] owns the page bookkeeping (page cap, chunking,
//! concurrency, reassembly, failure policy) and delegates pixels to a
//! [`PageRasterizer`]. [`PopplerRasterizer`] is the production rasterizer;
//! tests use [`MockRasterizer`](super::MockRasterizer).

use std::fmt;
use std::path::PathBuf;
use std::process::Output;
use std::str::FromStr;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("unreadable document: {0}")]
    Unreadable(String),

    #[error("pages {range} failed to render: {reason}")]
    ChunkFailed { range: PageRange, reason: String },

    #[error("no pages could be rendered ({failed} chunk(s) failed)")]
    NothingRendered { failed: usize },

    #[error("renderer I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Inclusive, 1-based page range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub first: u32,
    pub last: u32,
}

impl PageRange {
    pub fn len(&self) -> u32 {
        self.last + 1 - self.first
    }

    pub fn is_empty(&self) -> bool {
        self.last < self.first
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.first, self.last)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
        }
    }
}

impl FromStr for ImageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(ImageFormat::Png),
            "jpeg" | "jpg" => Ok(ImageFormat::Jpeg),
            other => Err(format!("unsupported image format '{other}' (expected png or jpeg)")),
        }
    }
}

/// What to do when some chunks of a document fail to render.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderPolicy {
    /// Any chunk failure fails the whole document.
    #[default]
    Strict,
    /// Keep the pages that rendered and flag the result as partial.
    Lenient,
}

impl FromStr for RenderPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(RenderPolicy::Strict),
            "lenient" => Ok(RenderPolicy::Lenient),
            other => Err(format!("unknown render policy '{other}' (expected strict or lenient)")),
        }
    }
}

/// One rendered page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    /// 1-based page number within its source document
    pub page_number: u32,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl PageImage {
    pub fn new(page_number: u32, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            page_number,
            mime_type: mime_type.into(),
            data,
        }
    }

    /// `data:<mime>;base64,<payload>` for vision APIs.
    pub fn data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.mime_type,
            base64::engine::general_purpose::STANDARD.encode(&self.data)
        )
    }
}

/// Pages of one document, in page order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedDocument {
    pub pages: Vec<PageImage>,
    /// Some pages are missing; see `failed_ranges`.
    pub partial: bool,
    pub failed_ranges: Vec<PageRange>,
}

impl RenderedDocument {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Converts a binary document into page images.
#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    /// Empty input yields an empty document, not an error.
    async fn render(&self, document: &[u8]) -> Result<RenderedDocument, RenderError>;
}

/// Low-level page rasterization used by [`ChunkedRenderer`].
#[async_trait]
pub trait PageRasterizer: Send + Sync {
    async fn page_count(&self, document: &[u8]) -> Result<u32, RenderError>;

    /// Render every page in `range`, in order.
    async fn rasterize(
        &self,
        document: &[u8],
        range: PageRange,
    ) -> Result<Vec<PageImage>, RenderError>;
}

#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub dpi: u32,
    /// Pages beyond this are ignored. `None` renders everything.
    pub max_pages: Option<u32>,
    pub image_format: ImageFormat,
    /// JPEG quality 0-100; ignored for PNG
    pub jpeg_quality: u8,
    pub chunk_size: u32,
    pub policy: RenderPolicy,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            dpi: 150,
            max_pages: None,
            image_format: ImageFormat::Png,
            jpeg_quality: 85,
            chunk_size: 10,
            policy: RenderPolicy::Strict,
        }
    }
}

/// Split `1..=pages` into consecutive ranges of at most `chunk_size` pages.
pub fn plan_chunks(pages: u32, chunk_size: u32) -> Vec<PageRange> {
    let chunk_size = chunk_size.max(1);
    (1..=pages)
        .step_by(chunk_size as usize)
        .map(|first| PageRange {
            first,
            last: (first + chunk_size - 1).min(pages),
        })
        .collect()
}

/// Renders a document chunk by chunk, all chunks concurrently.
pub struct ChunkedRenderer<R> {
    rasterizer: R,
    config: RenderConfig,
}

impl<R: PageRasterizer> ChunkedRenderer<R> {
    pub fn new(rasterizer: R, config: RenderConfig) -> Self {
        Self { rasterizer, config }
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }
}

#[async_trait]
impl<R: PageRasterizer> DocumentRenderer for ChunkedRenderer<R> {
    async fn render(&self, document: &[u8]) -> Result<RenderedDocument, RenderError> {
        if document.is_empty() {
            warn!("empty document provided, nothing to render");
            return Ok(RenderedDocument::empty());
        }

        let total_pages = self.rasterizer.page_count(document).await?;
        let pages_to_render = match self.config.max_pages {
            Some(max) => total_pages.min(max),
            None => total_pages,
        };
        if pages_to_render == 0 {
            info!("document has no pages");
            return Ok(RenderedDocument::empty());
        }

        let chunks = plan_chunks(pages_to_render, self.config.chunk_size);
        info!(
            pages = pages_to_render,
            total_pages,
            chunks = chunks.len(),
            dpi = self.config.dpi,
            "rendering document"
        );

        let results = futures::future::join_all(chunks.iter().map(|&range| async move {
            (range, self.rasterizer.rasterize(document, range).await)
        }))
        .await;

        let mut rendered = RenderedDocument::empty();
        for (range, result) in results {
            match result {
                Ok(images) => {
                    debug!(range = %range, images = images.len(), "chunk rendered");
                    rendered.pages.extend(images);
                }
                Err(e) => match self.config.policy {
                    RenderPolicy::Strict => {
                        return Err(RenderError::ChunkFailed {
                            range,
                            reason: e.to_string(),
                        });
                    }
                    RenderPolicy::Lenient => {
                        warn!(range = %range, error = %e, "chunk failed, continuing without it");
                        rendered.failed_ranges.push(range);
                    }
                },
            }
        }

        if rendered.pages.is_empty() {
            return Err(RenderError::NothingRendered {
                failed: rendered.failed_ranges.len(),
            });
        }

        rendered.partial = !rendered.failed_ranges.is_empty();
        rendered.pages.sort_by_key(|p| p.page_number);

        info!(
            pages = rendered.pages.len(),
            partial = rendered.partial,
            "document rendered"
        );
        Ok(rendered)
    }
}

/// Rasterizes PDFs with poppler's `pdfinfo` and `pdftoppm`.
#[derive(Debug, Clone)]
pub struct PopplerRasterizer {
    dpi: u32,
    format: ImageFormat,
    jpeg_quality: u8,
    scratch_dir: PathBuf,
    pdfinfo: String,
    pdftoppm: String,
}

impl PopplerRasterizer {
    pub fn new(config: &RenderConfig) -> Self {
        Self {
            dpi: config.dpi,
            format: config.image_format,
            jpeg_quality: config.jpeg_quality,
            scratch_dir: std::env::temp_dir(),
            pdfinfo: "pdfinfo".to_string(),
            pdftoppm: "pdftoppm".to_string(),
        }
    }

    /// Directory for temporary input and output files.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// Override tool paths (e.g. a bundled poppler build).
    pub fn with_binaries(mut self, pdfinfo: impl Into<String>, pdftoppm: impl Into<String>) -> Self {
        self.pdfinfo = pdfinfo.into();
        self.pdftoppm = pdftoppm.into();
        self
    }

    async fn write_scratch(&self, document: &[u8]) -> Result<ScratchFile, RenderError> {
        let path = self
            .scratch_dir
            .join(format!("intake-{}.pdf", Uuid::new_v4()));
        tokio::fs::write(&path, document).await?;
        Ok(ScratchFile(path))
    }
}

/// Removes the wrapped file on drop.
struct ScratchFile(PathBuf);

impl Drop for ScratchFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

fn tool_failure(tool: &str, output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    format!("{tool} exited with {}: {}", output.status, stderr.trim())
}

/// Pull the `Pages:` value out of `pdfinfo` output.
fn parse_page_count(pdfinfo_output: &str) -> Option<u32> {
    pdfinfo_output
        .lines()
        .find_map(|line| line.strip_prefix("Pages:"))
        .and_then(|value| value.trim().parse().ok())
}

/// Page number from a `pdftoppm` output name like `<prefix>-07.png`.
fn page_number_from_file(name: &str, prefix: &str, extension: &str) -> Option<u32> {
    name.strip_prefix(prefix)?
        .strip_prefix('-')?
        .strip_suffix(extension)?
        .strip_suffix('.')?
        .parse()
        .ok()
}

#[async_trait]
impl PageRasterizer for PopplerRasterizer {
    async fn page_count(&self, document: &[u8]) -> Result<u32, RenderError> {
        let input = self.write_scratch(document).await?;

        let output = Command::new(&self.pdfinfo)
            .arg(&input.0)
            .output()
            .await
            .map_err(|e| RenderError::Unreadable(format!("failed to run {}: {e}", self.pdfinfo)))?;

        if !output.status.success() {
            return Err(RenderError::Unreadable(tool_failure(&self.pdfinfo, &output)));
        }

        parse_page_count(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            RenderError::Unreadable("pdfinfo output has no page count".to_string())
        })
    }

    async fn rasterize(
        &self,
        document: &[u8],
        range: PageRange,
    ) -> Result<Vec<PageImage>, RenderError> {
        let input = self.write_scratch(document).await?;
        let prefix = format!("intake-{}", Uuid::new_v4());
        let output_root = self.scratch_dir.join(&prefix);

        let mut command = Command::new(&self.pdftoppm);
        command
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg("-f")
            .arg(range.first.to_string())
            .arg("-l")
            .arg(range.last.to_string());
        match self.format {
            ImageFormat::Png => {
                command.arg("-png");
            }
            ImageFormat::Jpeg => {
                command
                    .arg("-jpeg")
                    .arg("-jpegopt")
                    .arg(format!("quality={}", self.jpeg_quality));
            }
        }
        command.arg(&input.0).arg(&output_root);

        debug!(range = %range, dpi = self.dpi, "running pdftoppm");
        let output = command.output().await?;
        if !output.status.success() {
            return Err(RenderError::ChunkFailed {
                range,
                reason: tool_failure(&self.pdftoppm, &output),
            });
        }

        let extension = self.format.extension();
        let mut pages = Vec::with_capacity(range.len() as usize);
        let mut entries = tokio::fs::read_dir(&self.scratch_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(page_number) = page_number_from_file(&name, &prefix, extension) else {
                continue;
            };
            let page_file = ScratchFile(entry.path());
            let data = tokio::fs::read(&page_file.0).await?;
            pages.push(PageImage::new(page_number, self.format.mime_type(), data));
        }

        pages.sort_by_key(|p| p.page_number);
        if pages.len() != range.len() as usize {
            return Err(RenderError::ChunkFailed {
                range,
                reason: format!("expected {} page(s), got {}", range.len(), pages.len()),
            });
        }
        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::MockRasterizer;

    fn config(policy: RenderPolicy) -> RenderConfig {
        RenderConfig {
            chunk_size: 2,
            policy,
            ..RenderConfig::default()
        }
    }

    #[test]
    fn test_plan_chunks() {
        assert_eq!(
            plan_chunks(5, 2),
            vec![
                PageRange { first: 1, last: 2 },
                PageRange { first: 3, last: 4 },
                PageRange { first: 5, last: 5 },
            ]
        );
        assert_eq!(plan_chunks(3, 10), vec![PageRange { first: 1, last: 3 }]);
        assert!(plan_chunks(0, 10).is_empty());
        assert_eq!(plan_chunks(2, 0).len(), 2);
    }

    #[test]
    fn test_parse_page_count() {
        let output = "Title:          Referral\nPages:          12\nEncrypted:      no\n";
        assert_eq!(parse_page_count(output), Some(12));
        assert_eq!(parse_page_count("Title: x"), None);
    }

    #[test]
    fn test_page_number_from_file() {
        assert_eq!(
            page_number_from_file("intake-abc-07.png", "intake-abc", "png"),
            Some(7)
        );
        assert_eq!(
            page_number_from_file("intake-abc-12.jpg", "intake-abc", "jpg"),
            Some(12)
        );
        assert_eq!(page_number_from_file("intake-xyz-1.png", "intake-abc", "png"), None);
        assert_eq!(page_number_from_file("intake-abc.pdf", "intake-abc", "png"), None);
    }

    #[test]
    fn test_policy_and_format_parse() {
        assert_eq!("Lenient".parse::<RenderPolicy>(), Ok(RenderPolicy::Lenient));
        assert_eq!("jpg".parse::<ImageFormat>(), Ok(ImageFormat::Jpeg));
        assert!("tiff".parse::<ImageFormat>().is_err());
        assert_eq!(RenderPolicy::default(), RenderPolicy::Strict);
    }

    #[test]
    fn test_data_url() {
        let page = PageImage::new(1, "image/png", vec![1, 2, 3]);
        assert_eq!(page.data_url(), "data:image/png;base64,AQID");
    }

    #[tokio::test]
    async fn test_empty_document_renders_nothing() {
        let renderer = ChunkedRenderer::new(MockRasterizer::new(3), config(RenderPolicy::Strict));
        let rendered = renderer.render(&[]).await.unwrap();
        assert!(rendered.pages.is_empty());
        assert!(!rendered.partial);
    }

    #[tokio::test]
    async fn test_pages_reassembled_in_order() {
        let renderer = ChunkedRenderer::new(MockRasterizer::new(5), config(RenderPolicy::Strict));
        let rendered = renderer.render(b"%PDF").await.unwrap();

        let numbers: Vec<u32> = rendered.pages.iter().map(|p| p.page_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
        assert!(!rendered.partial);
    }

    #[tokio::test]
    async fn test_max_pages_caps_render() {
        let renderer = ChunkedRenderer::new(
            MockRasterizer::new(50),
            RenderConfig {
                max_pages: Some(3),
                ..config(RenderPolicy::Strict)
            },
        );
        assert_eq!(renderer.render(b"%PDF").await.unwrap().pages.len(), 3);
    }

    #[tokio::test]
    async fn test_strict_policy_fails_on_any_chunk() {
        let rasterizer = MockRasterizer::new(5).failing_at(3);
        let renderer = ChunkedRenderer::new(rasterizer, config(RenderPolicy::Strict));

        let err = renderer.render(b"%PDF").await.unwrap_err();
        assert!(matches!(
            err,
            RenderError::ChunkFailed {
                range: PageRange { first: 3, last: 4 },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_lenient_policy_flags_partial() {
        let rasterizer = MockRasterizer::new(5).failing_at(3);
        let renderer = ChunkedRenderer::new(rasterizer, config(RenderPolicy::Lenient));

        let rendered = renderer.render(b"%PDF").await.unwrap();
        let numbers: Vec<u32> = rendered.pages.iter().map(|p| p.page_number).collect();

        assert_eq!(numbers, vec![1, 2, 5]);
        assert!(rendered.partial);
        assert_eq!(rendered.failed_ranges, vec![PageRange { first: 3, last: 4 }]);
    }

    #[tokio::test]
    async fn test_lenient_policy_with_nothing_rendered_fails() {
        let rasterizer = MockRasterizer::new(1).failing_at(1);
        let renderer = ChunkedRenderer::new(rasterizer, config(RenderPolicy::Lenient));
        assert!(matches!(
            renderer.render(b"%PDF").await,
            Err(RenderError::NothingRendered { failed: 1 })
        ));
    }

    #[tokio::test]
    async fn test_unreadable_document() {
        let renderer =
            ChunkedRenderer::new(MockRasterizer::unreadable(), config(RenderPolicy::Strict));
        assert!(matches!(
            renderer.render(b"not a pdf").await,
            Err(RenderError::Unreadable(_))
        ));
    }
}
