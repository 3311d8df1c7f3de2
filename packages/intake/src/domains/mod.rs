// Business domains
pub mod cases;
pub mod extraction;
pub mod ingestion;
