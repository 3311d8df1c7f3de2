//! Applies extractions to the case store, one case at a time.
//!
//! Same-case merges are serialized twice over: an in-process keyed lock
//! ([`CaseLocks`]) orders workers in this process, and the store's version
//! compare-and-swap catches writers in other processes. On a version
//! conflict the case is re-read and the merge recomputed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use super::activities::{reconcile, MergeOutcome, Reconciliation};
use super::models::{CanonicalCase, CaseKey, ExtractionResult};
use super::store::{CaseStore, StoreError};
use crate::error::{IntakeError, Result};

/// Re-reads allowed after a lost compare-and-swap before giving up.
pub const DEFAULT_CONFLICT_RETRIES: u32 = 5;

/// Proof that the holder owns the per-case lock for `key`.
pub struct CaseGuard {
    key: CaseKey,
    _lock: OwnedMutexGuard<()>,
}

impl CaseGuard {
    pub fn key(&self) -> &CaseKey {
        &self.key
    }
}

/// Keyed async mutexes, one per case key in use.
#[derive(Default)]
pub struct CaseLocks {
    locks: Mutex<HashMap<CaseKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl CaseLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &CaseKey) -> CaseGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // drop entries nobody holds or waits on
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key.clone()).or_default().clone()
        };

        CaseGuard {
            key: key.clone(),
            _lock: lock.lock_owned().await,
        }
    }

    /// Number of keys currently held or awaited.
    pub fn active(&self) -> usize {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.values().filter(|l| Arc::strong_count(l) > 1).count()
    }
}

/// Merges extractions into canonical cases.
pub struct CaseReconciler {
    store: Arc<dyn CaseStore>,
    locks: CaseLocks,
    conflict_retries: u32,
}

impl CaseReconciler {
    pub fn new(store: Arc<dyn CaseStore>) -> Self {
        Self {
            store,
            locks: CaseLocks::new(),
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }

    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    pub fn store(&self) -> &Arc<dyn CaseStore> {
        &self.store
    }

    /// Lock the case, merge, and persist. The write is all-or-nothing.
    pub async fn apply(&self, extraction: &ExtractionResult) -> Result<Reconciliation> {
        extraction
            .validate()
            .map_err(|missing| IntakeError::InvalidExtraction { missing })?;

        let key = extraction.case_key();
        let guard = self.locks.acquire(&key).await;

        let mut attempt = 0;
        loop {
            let existing = self.store.find(&key).await?;
            let mut reconciliation = reconcile(existing.as_ref(), extraction, Utc::now())?;

            match self.commit(&guard, &reconciliation.case).await {
                Ok(saved) => {
                    log_outcome(&reconciliation, &saved);
                    reconciliation.case = saved;
                    return Ok(reconciliation);
                }
                Err(IntakeError::Store(StoreError::VersionConflict { expected, .. }))
                    if attempt < self.conflict_retries =>
                {
                    attempt += 1;
                    warn!(
                        case_key = %key,
                        expected_version = expected,
                        attempt,
                        "case changed concurrently, re-merging"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Persist a case under its lock.
    ///
    /// Fails with [`IntakeError::LockNotHeld`] if `guard` is for another case.
    pub async fn commit(&self, guard: &CaseGuard, case: &CanonicalCase) -> Result<CanonicalCase> {
        if guard.key != case.case_key {
            return Err(IntakeError::LockNotHeld {
                held: guard.key.clone(),
                target: case.case_key.clone(),
            });
        }
        Ok(self.store.save(case).await?)
    }

    /// Lock a case for a caller that writes through [`commit`](Self::commit).
    pub async fn lock(&self, key: &CaseKey) -> CaseGuard {
        self.locks.acquire(key).await
    }

    pub async fn find(&self, case_number: &str) -> Result<Option<CanonicalCase>> {
        Ok(self.store.find(&CaseKey::normalize(case_number)).await?)
    }
}

fn log_outcome(reconciliation: &Reconciliation, saved: &CanonicalCase) {
    match reconciliation.outcome {
        MergeOutcome::Created => info!(
            case_key = %saved.case_key,
            confidence = saved.confidence,
            "case created"
        ),
        MergeOutcome::Overwritten {
            previous_confidence,
        } => info!(
            case_key = %saved.case_key,
            previous_confidence,
            confidence = saved.confidence,
            "case overwritten by higher-confidence extraction"
        ),
        MergeOutcome::Merged if !reconciliation.conflicts.is_empty() => warn!(
            case_key = %saved.case_key,
            conflicts = reconciliation.conflicts.len(),
            "case merged with conflicts, manual review needed"
        ),
        MergeOutcome::Merged => debug!(case_key = %saved.case_key, "case merged"),
    }

    if !reconciliation.missing.critical.is_empty() {
        info!(
            case_key = %saved.case_key,
            missing = ?reconciliation.missing.critical,
            "case missing critical fields"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::cases::models::{IdentifyingFields, OptionalFields};
    use crate::domains::cases::store::MemoryCaseStore;

    fn extraction(case: &str, confidence: f64, optional: OptionalFields) -> ExtractionResult {
        ExtractionResult::builder()
            .identifying(IdentifyingFields::new(case, "Doe", "Ortho"))
            .optional(optional)
            .confidence(confidence)
            .build()
    }

    #[tokio::test]
    async fn test_apply_persists_each_branch() {
        let reconciler = CaseReconciler::new(Arc::new(MemoryCaseStore::new()));

        let created = reconciler
            .apply(&extraction("NF-1", 0.9, OptionalFields::default()))
            .await
            .unwrap();
        assert_eq!(created.outcome, MergeOutcome::Created);
        assert_eq!(created.case.version, 1);

        let merged = reconciler
            .apply(&extraction(
                "nf-1",
                0.5,
                OptionalFields::builder().exam_date("2025-03-10").build(),
            ))
            .await
            .unwrap();
        assert_eq!(merged.outcome, MergeOutcome::Merged);
        assert_eq!(merged.case.version, 2);

        let stored = reconciler.find(" nf-1 ").await.unwrap().unwrap();
        assert_eq!(stored.optional.exam_date.as_deref(), Some("2025-03-10"));
        assert_eq!(stored.confidence, 0.9);
    }

    #[tokio::test]
    async fn test_invalid_extraction_touches_nothing() {
        let store = Arc::new(MemoryCaseStore::new());
        let reconciler = CaseReconciler::new(store.clone());

        let bad = ExtractionResult::builder()
            .identifying(IdentifyingFields::new("NF-1", "", "Ortho"))
            .confidence(0.9)
            .build();

        assert!(matches!(
            reconciler.apply(&bad).await,
            Err(IntakeError::InvalidExtraction { .. })
        ));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_rejects_foreign_guard() {
        let reconciler = CaseReconciler::new(Arc::new(MemoryCaseStore::new()));
        let case = reconcile(
            None,
            &extraction("NF-2", 0.9, OptionalFields::default()),
            Utc::now(),
        )
        .unwrap()
        .case;

        let guard = reconciler.lock(&CaseKey::normalize("NF-1")).await;
        let err = reconciler.commit(&guard, &case).await.unwrap_err();

        assert!(matches!(err, IntakeError::LockNotHeld { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_locks_are_pruned() {
        let locks = CaseLocks::new();
        {
            let _a = locks.acquire(&CaseKey::normalize("NF-1")).await;
            let _b = locks.acquire(&CaseKey::normalize("NF-2")).await;
            assert_eq!(locks.active(), 2);
        }
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn test_same_key_lock_is_exclusive() {
        let locks = Arc::new(CaseLocks::new());
        let key = CaseKey::normalize("NF-1");
        let guard = locks.acquire(&key).await;

        let waiter = {
            let locks = locks.clone();
            let key = key.clone();
            tokio::spawn(async move { locks.acquire(&key).await.key().clone() })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        assert_eq!(waiter.await.unwrap(), key);
    }
}
