//! Canonical case persistence.
//!
//! Writes are compare-and-swap on `version`: inserting requires that the key
//! is free, updating requires that nobody wrote since the case was read.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;

use super::models::{CanonicalCase, CaseKey};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("case store unavailable: {0}")]
    Unavailable(String),

    #[error("case {key} changed since version {expected}")]
    VersionConflict { key: CaseKey, expected: i64 },
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

#[async_trait]
pub trait CaseStore: Send + Sync {
    async fn find(&self, key: &CaseKey) -> Result<Option<CanonicalCase>, StoreError>;

    /// Persist `case` and return it at its new version.
    ///
    /// `case.version == 0` inserts; anything else updates only if the stored
    /// version still matches. Either failing yields
    /// [`StoreError::VersionConflict`].
    async fn save(&self, case: &CanonicalCase) -> Result<CanonicalCase, StoreError>;

    async fn list(&self) -> Result<Vec<CanonicalCase>, StoreError>;
}

/// Case store held in process memory.
#[derive(Default)]
pub struct MemoryCaseStore {
    cases: RwLock<HashMap<CaseKey, CanonicalCase>>,
}

impl MemoryCaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CaseStore for MemoryCaseStore {
    async fn find(&self, key: &CaseKey) -> Result<Option<CanonicalCase>, StoreError> {
        let cases = self.cases.read().unwrap_or_else(|e| e.into_inner());
        Ok(cases.get(key).cloned())
    }

    async fn save(&self, case: &CanonicalCase) -> Result<CanonicalCase, StoreError> {
        let mut cases = self.cases.write().unwrap_or_else(|e| e.into_inner());

        let current = cases.get(&case.case_key).map_or(0, |c| c.version);
        if current != case.version {
            return Err(StoreError::VersionConflict {
                key: case.case_key.clone(),
                expected: case.version,
            });
        }

        let mut saved = case.clone();
        saved.version += 1;
        cases.insert(saved.case_key.clone(), saved.clone());
        Ok(saved)
    }

    async fn list(&self) -> Result<Vec<CanonicalCase>, StoreError> {
        let cases = self.cases.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<CanonicalCase> = cases.values().cloned().collect();
        all.sort_by(|a, b| a.case_key.cmp(&b.case_key));
        Ok(all)
    }
}

/// PostgreSQL-backed case store.
#[derive(Clone)]
pub struct PostgresCaseStore {
    pool: PgPool,
}

impl PostgresCaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CaseStore for PostgresCaseStore {
    async fn find(&self, key: &CaseKey) -> Result<Option<CanonicalCase>, StoreError> {
        Ok(CanonicalCase::find_by_key(key, &self.pool).await?)
    }

    async fn save(&self, case: &CanonicalCase) -> Result<CanonicalCase, StoreError> {
        let saved = if case.is_persisted() {
            case.update_if_current(&self.pool).await?
        } else {
            case.insert(&self.pool).await?
        };

        saved.ok_or_else(|| StoreError::VersionConflict {
            key: case.case_key.clone(),
            expected: case.version,
        })
    }

    async fn list(&self) -> Result<Vec<CanonicalCase>, StoreError> {
        Ok(CanonicalCase::find_all(&self.pool).await?)
    }
}
