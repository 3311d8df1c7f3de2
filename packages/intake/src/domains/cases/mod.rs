pub mod activities;
pub mod models;
pub mod reconciler;
pub mod store;

pub use activities::{reconcile, FieldConflict, MergeOutcome, MissingFields, Reconciliation};
pub use models::{
    AttachmentCategory, AttachmentClassification, CanonicalCase, CaseKey, CaseStatus,
    ExtractionResult, IdentifyingField, IdentifyingFields, Intent, OptionalField, OptionalFields,
    ReviewRecommendation,
};
pub use reconciler::{CaseGuard, CaseLocks, CaseReconciler};
pub use store::{CaseStore, MemoryCaseStore, PostgresCaseStore, StoreError};
