// Referral Intake - Ingestion & Reconciliation Engine
//
// Turns inbound correspondence into queued, retryable jobs; each job renders
// attachments, asks the extraction service for a structured record, and
// reconciles that record into the single canonical case for its case number.
//
// Layout follows the usual split: kernel/ holds transport-agnostic
// infrastructure (job queue, workers, document rendering), domains/ holds
// the business logic (cases, extraction, ingestion).

pub mod common;
pub mod config;
pub mod domains;
pub mod error;
pub mod kernel;

pub use config::*;
pub use error::{IntakeError, Result};
