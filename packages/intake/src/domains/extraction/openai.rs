use async_trait::async_trait;
use openai_client::{
    strip_code_blocks, ImageDetail, Message, OpenAIClient, OpenAIError, StructuredOutput,
    StructuredRequest,
};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::prompts::{user_prompt, SYSTEM_PROMPT};
use super::{ExtractionAdapter, ExtractionError};
use crate::domains::cases::models::{
    AttachmentCategory, AttachmentClassification, ExtractionResult, IdentifyingFields, Intent,
    OptionalFields,
};
use crate::domains::ingestion::InboundMessage;
use crate::kernel::PageImage;

pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const EXTRACTION_TEMPERATURE: f32 = 0.1;

/// Response shape the model is constrained to.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct CaseExtractionResponse {
    pub case_number: String,
    pub patient_name: String,
    pub exam_type: String,
    pub exam_date: Option<String>,
    pub exam_time: Option<String>,
    pub exam_location: Option<String>,
    pub referring_party: Option<String>,
    pub referring_email: Option<String>,
    pub report_due_date: Option<String>,
    pub confidence: f64,
    pub extraction_notes: Option<String>,
    pub email_intent: String,
    pub attachments: Vec<AttachmentResponse>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct AttachmentResponse {
    pub filename: String,
    pub category: String,
    pub category_reason: Option<String>,
}

impl TryFrom<CaseExtractionResponse> for ExtractionResult {
    type Error = ExtractionError;

    fn try_from(r: CaseExtractionResponse) -> Result<Self, Self::Error> {
        if !(0.0..=1.0).contains(&r.confidence) {
            return Err(ExtractionError::Malformed(format!(
                "confidence {} outside [0, 1]",
                r.confidence
            )));
        }

        Ok(ExtractionResult {
            identifying: IdentifyingFields::new(r.case_number, r.patient_name, r.exam_type),
            optional: OptionalFields {
                exam_date: r.exam_date,
                exam_time: r.exam_time,
                exam_location: r.exam_location,
                referring_party: r.referring_party,
                referring_email: r.referring_email,
                report_due_date: r.report_due_date,
            },
            confidence: r.confidence,
            notes: r.extraction_notes,
            intent: Intent::parse_lenient(&r.email_intent),
            attachments: r
                .attachments
                .into_iter()
                .map(|a| AttachmentClassification {
                    filename: a.filename,
                    category: AttachmentCategory::parse_lenient(&a.category),
                    category_reason: a.category_reason,
                })
                .collect(),
        })
    }
}

/// Vision-capable structured extraction against the OpenAI chat API.
#[derive(Clone)]
pub struct OpenAiExtractionAdapter {
    client: OpenAIClient,
    model: String,
    detail: ImageDetail,
}

impl OpenAiExtractionAdapter {
    pub fn new(client: OpenAIClient) -> Self {
        Self {
            client,
            model: DEFAULT_MODEL.to_string(),
            detail: ImageDetail::High,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_detail(mut self, detail: ImageDetail) -> Self {
        self.detail = detail;
        self
    }

    fn messages(&self, message: &InboundMessage, images: &[PageImage]) -> Vec<Message> {
        vec![
            Message::system(SYSTEM_PROMPT),
            Message::user_with_images(
                user_prompt(message, images.len()),
                images.iter().map(PageImage::data_url),
                self.detail,
            ),
        ]
    }
}

#[async_trait]
impl ExtractionAdapter for OpenAiExtractionAdapter {
    async fn extract(
        &self,
        message: &InboundMessage,
        images: &[PageImage],
    ) -> Result<ExtractionResult, ExtractionError> {
        let request = StructuredRequest::with_messages(
            &self.model,
            self.messages(message, images),
            CaseExtractionResponse::openai_schema(),
        )
        .temperature(EXTRACTION_TEMPERATURE);

        debug!(
            model = %self.model,
            images = images.len(),
            subject = %message.subject,
            "requesting extraction"
        );

        let raw = self.client.structured_output(request).await.map_err(|e| {
            warn!(error = %e, model = %self.model, "extraction request failed");
            ExtractionError::from(e)
        })?;

        let response: CaseExtractionResponse = serde_json::from_str(strip_code_blocks(&raw))
            .map_err(|e| ExtractionError::Malformed(e.to_string()))?;
        let result = ExtractionResult::try_from(response)?;

        info!(
            case_number = %result.identifying.case_number,
            confidence = result.confidence,
            review = %result.review(),
            intent = %result.intent,
            "extraction complete"
        );
        Ok(result)
    }
}

impl From<OpenAIError> for ExtractionError {
    fn from(e: OpenAIError) -> Self {
        match e {
            OpenAIError::Parse(msg) => ExtractionError::Malformed(msg),
            other => ExtractionError::Unavailable(other.to_string()),
        }
    }
}
