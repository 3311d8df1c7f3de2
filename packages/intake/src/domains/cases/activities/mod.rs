pub mod reconcile;

pub use reconcile::{
    reconcile, FieldConflict, MergeOutcome, MissingFields, ReconcileError, Reconciliation,
    CRITICAL_FIELDS, FOLLOW_UP_ACTION, SEMI_CRITICAL_FIELDS,
};
