//! Pure OpenAI REST API client
//!
//! A minimal client for schema-constrained structured outputs from the chat
//! completions endpoint, including vision input (image parts). No domain
//! logic lives here.
//!
//! # Example
//!
//! ```rust,ignore
//! use openai_client::{ImageDetail, Message, OpenAIClient, StructuredOutput, StructuredRequest};
//!
//! #[derive(serde::Deserialize, schemars::JsonSchema)]
//! struct Referral {
//!     case_number: String,
//! }
//!
//! let client = OpenAIClient::new(api_key);
//! let request = StructuredRequest::with_messages(
//!     "gpt-4o",
//!     vec![
//!         Message::system(system_prompt),
//!         Message::user_with_images(user_prompt, page_data_urls, ImageDetail::High),
//!     ],
//!     Referral::openai_schema(),
//! );
//! let json = client.structured_output(request).await?;
//! ```

pub mod error;
pub mod schema;
pub mod types;

pub use error::{OpenAIError, Result};
pub use schema::StructuredOutput;
pub use types::*;

use std::time::{Duration, Instant};

use reqwest::Client;
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Clone)]
pub struct OpenAIClient {
    http_client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAIClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http_client: Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Point at a proxy or compatible endpoint.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Apply a per-request timeout to every call made by this client.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OpenAIError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(self)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Structured output with JSON schema.
    ///
    /// Returns the raw JSON text of the first choice; callers deserialize it
    /// into the type the schema was generated from.
    pub async fn structured_output(&self, request: StructuredRequest) -> Result<String> {
        let start = Instant::now();

        let raw = self.post_chat(&request).await?;
        let usage = raw.usage.clone();
        let content = first_content(raw)?;

        debug!(
            model = %request.model,
            images = request.messages.iter().map(Message::image_count).sum::<usize>(),
            prompt_tokens = usage.as_ref().map(|u| u.prompt_tokens),
            completion_tokens = usage.as_ref().map(|u| u.completion_tokens),
            duration_ms = start.elapsed().as_millis() as u64,
            "OpenAI structured output"
        );

        Ok(content)
    }

    async fn post_chat<B: serde::Serialize>(&self, body: &B) -> Result<ChatResponseRaw> {
        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "OpenAI request failed");
                OpenAIError::Network(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(status = %status, error = %error_text, "OpenAI API error");
            return Err(OpenAIError::Api(format!(
                "OpenAI API error ({}): {}",
                status, error_text
            )));
        }

        response
            .json()
            .await
            .map_err(|e| OpenAIError::Parse(e.to_string()))
    }
}

fn first_content(raw: ChatResponseRaw) -> Result<String> {
    let message = raw
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or_else(|| OpenAIError::Api("No response from OpenAI".into()))?;

    if let Some(refusal) = message.refusal {
        return Err(OpenAIError::Api(format!("Model refused: {}", refusal)));
    }

    message
        .content
        .ok_or_else(|| OpenAIError::Api("Empty response content from OpenAI".into()))
}
