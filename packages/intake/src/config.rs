use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use openai_client::ImageDetail;

use crate::kernel::jobs::{JobWorkerConfig, QueueConfig, RetryPolicy, DEFAULT_MAX_ATTEMPTS};
use crate::kernel::{ImageFormat, RenderConfig, RenderPolicy};

/// Engine configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub openai_api_key: String,
    pub openai_model: String,
    pub vision_image_detail: ImageDetail,
    /// Deployment name (dev, staging, prod); part of the default worker name
    pub env: String,
    pub worker_name: String,
    pub worker_concurrency: usize,
    pub poll_interval: Duration,
    pub queue: QueueConfig,
    pub pdf_conversion_enabled: bool,
    pub render: RenderConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = lookup("ENV").unwrap_or_else(|| "dev".to_string());
        let worker_name = lookup("WORKER_NAME").unwrap_or_else(|| format!("worker-{env}"));

        let queue = QueueConfig {
            job_timeout: Duration::from_secs(parsed(&lookup, "QUEUE_DEFAULT_TIMEOUT", 600)?),
            max_attempts: parsed(&lookup, "QUEUE_RETRY_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?,
            retry: RetryPolicy {
                base: Duration::from_secs(parsed(&lookup, "QUEUE_RETRY_BASE_SECS", 1)?),
                cap: Duration::from_secs(parsed(&lookup, "QUEUE_RETRY_CAP_SECS", 300)?),
            },
        };
        if queue.max_attempts < 1 {
            return Err(anyhow!("QUEUE_RETRY_ATTEMPTS must be at least 1"));
        }

        let render = RenderConfig {
            dpi: parsed(&lookup, "PDF_CONVERSION_DPI", 150)?,
            max_pages: lookup("PDF_MAX_PAGES")
                .map(|v| v.trim().parse::<u32>())
                .transpose()
                .context("PDF_MAX_PAGES must be a valid number")?,
            image_format: parsed(&lookup, "PDF_IMAGE_FORMAT", ImageFormat::Png)?,
            jpeg_quality: parsed(&lookup, "PDF_COMPRESSION_QUALITY", 85)?,
            chunk_size: parsed(&lookup, "PDF_CHUNK_SIZE", 10)?,
            policy: parsed(&lookup, "RENDER_POLICY", RenderPolicy::Strict)?,
        };

        Ok(Self {
            database_url: lookup("DATABASE_URL").context("DATABASE_URL must be set")?,
            openai_api_key: lookup("OPENAI_API_KEY").context("OPENAI_API_KEY must be set")?,
            openai_model: lookup("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o".to_string()),
            vision_image_detail: parsed(&lookup, "VISION_IMAGE_DETAIL", ImageDetail::High)?,
            env,
            worker_name,
            worker_concurrency: parsed(&lookup, "WORKER_CONCURRENCY", 1)?,
            poll_interval: Duration::from_millis(parsed(&lookup, "QUEUE_POLL_INTERVAL_MS", 1000)?),
            queue,
            pdf_conversion_enabled: parsed(&lookup, "PDF_CONVERSION_ENABLED", true)?,
            render,
        })
    }

    pub fn worker_config(&self) -> JobWorkerConfig {
        JobWorkerConfig {
            worker_id: self.worker_name.clone(),
            poll_interval: self.poll_interval,
        }
    }
}

fn parsed<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("{key} is invalid: {e}")),
        None => Ok(default),
    }
}
