//! Inbound correspondence as submitted to the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::kernel::jobs::CommandMeta;

/// One piece of correspondence: an email with its attachments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub subject: String,
    pub sender: String,
    #[serde(default)]
    pub recipients: Vec<String>,
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Defaults to submission time when absent
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
}

impl InboundMessage {
    pub fn new(
        subject: impl Into<String>,
        sender: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            sender: sender.into(),
            recipients: Vec::new(),
            body: body.into(),
            attachments: Vec::new(),
            received_at: None,
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

/// A message attachment.
///
/// Text attachments carry `text_content`; binary documents (PDFs, images)
/// carry raw bytes in `data`, base64-encoded on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub text_content: Option<String>,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
}

impl Attachment {
    pub fn text(filename: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            content_type: Some("text/plain".to_string()),
            text_content: Some(text.into()),
            data: None,
        }
    }

    pub fn pdf(filename: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content_type: Some("application/pdf".to_string()),
            text_content: None,
            data: Some(data),
        }
    }

    pub fn is_pdf(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.eq_ignore_ascii_case("application/pdf"))
            || self.filename.to_ascii_lowercase().ends_with(".pdf")
    }

    pub fn is_image(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("image/"))
    }
}

/// Job payload: process one inbound message end to end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessMessage {
    pub message: InboundMessage,
}

impl ProcessMessage {
    pub const JOB_TYPE: &'static str = "process_message";
}

impl CommandMeta for ProcessMessage {
    fn command_type(&self) -> &'static str {
        Self::JOB_TYPE
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match data {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}
