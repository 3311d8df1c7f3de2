//! Prompts for referral extraction.

use openai_client::truncate_to_char_boundary;

use crate::domains::ingestion::InboundMessage;

/// Bytes of each text attachment quoted in the user prompt.
pub const ATTACHMENT_PREVIEW_BYTES: usize = 200;

pub const SYSTEM_PROMPT: &str = r#"You are the intake coordinator for an Independent Medical Examination (IME) practice. You read referral correspondence from insurers, attorneys and adjusters and record the case it concerns.

Correspondence usually falls into one of these kinds:
- a new referral naming a patient and the exam requested
- a scheduling update for an existing case (date, time or location changes)
- a document submission (medical records, declarations, cover letters)
- a general inquiry about a case

Fill in every field you can support from the text and any attached page images:
- case_number: copy it exactly as written, keeping prefixes, dashes and letter case
- patient_name: the examinee's full name
- exam_type: the kind of examination requested (for example Orthopedic, Neurology, Psychiatric)
- exam_date and report_due_date: ISO format YYYY-MM-DD
- exam_time: 24-hour HH:MM
- exam_location, referring_party, referring_email: as stated; leave null when absent

Never invent a value. A field you cannot find is null.

Classify each attachment as one of medical_records, declaration, cover_letter or other, with a short reason.
Classify the message intent as one of new_referral, scheduling_update, document_submission, inquiry or other.

Report confidence between 0 and 1:
- 0.9 to 1.0: every identifying field is stated explicitly and unambiguously
- 0.7 to 0.9: identifying fields are present but some details needed interpretation
- 0.5 to 0.7: some identifying fields were inferred or the text is ambiguous
- below 0.5: key information is missing or contradictory

Use extraction_notes for anything uncertain, conflicting or worth a human's attention."#;

/// User prompt for one message: headers, body, and an attachment listing.
pub fn user_prompt(message: &InboundMessage, page_images: usize) -> String {
    let attachments = if message.attachments.is_empty() {
        "(none)".to_string()
    } else {
        message
            .attachments
            .iter()
            .map(|att| {
                let content_type = att.content_type.as_deref().unwrap_or("unknown");
                match att.text_content.as_deref() {
                    Some(text) => format!(
                        "- {} ({}): {}...",
                        att.filename,
                        content_type,
                        truncate_to_char_boundary(text, ATTACHMENT_PREVIEW_BYTES)
                    ),
                    None if att.is_pdf() => {
                        format!("- {} ({}): [rendered as page images]", att.filename, content_type)
                    }
                    None => format!("- {} ({})", att.filename, content_type),
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let mut prompt = format!(
        "Extract the case information from this correspondence.\n\n\
         Subject: {}\n\
         From: {}\n\n\
         Body:\n{}\n\n\
         Attachments:\n{}",
        message.subject, message.sender, message.body, attachments
    );

    if page_images > 0 {
        prompt.push_str(&format!(
            "\n\n{page_images} document page image(s) follow, in attachment and page order."
        ));
    }
    prompt
}
