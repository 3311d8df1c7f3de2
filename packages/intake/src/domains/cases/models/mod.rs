pub mod case;
pub mod extraction;

pub use case::{CanonicalCase, CaseKey, CaseStatus};
pub use extraction::{
    AttachmentCategory, AttachmentClassification, ExtractionResult, IdentifyingField,
    IdentifyingFields, Intent, OptionalField, OptionalFields, ReviewRecommendation,
};
