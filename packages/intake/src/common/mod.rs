// Common types shared across the kernel and domains

pub mod id;

pub use id::{Id, IntakeJob, JobId};
