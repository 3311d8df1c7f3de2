//! Worker registry.
//!
//! Every running worker holds a unique name for as long as it runs. A name
//! left behind by a worker that crashed blocks restarts under the same name
//! until an operator clears the registrations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("worker name already registered: {0}")]
    NameConflict(String),

    #[error("worker registry unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for RegistryError {
    fn from(e: sqlx::Error) -> Self {
        RegistryError::Unavailable(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkerRegistration {
    pub name: String,
    pub hostname: Option<String>,
    pub pid: i32,
    pub registered_at: DateTime<Utc>,
}

impl WorkerRegistration {
    /// Registration for `name` in the current process.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hostname: std::env::var("HOSTNAME").ok(),
            pid: std::process::id() as i32,
            registered_at: Utc::now(),
        }
    }
}

/// Registry of live worker names.
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    /// Claim `name`. Fails with [`RegistryError::NameConflict`] if it is held.
    async fn register(&self, name: &str) -> Result<WorkerRegistration, RegistryError>;

    /// Release `name`. Returns whether it was registered.
    async fn deregister(&self, name: &str) -> Result<bool, RegistryError>;

    /// Drop every registration, including stale ones. Returns how many.
    async fn clear_all(&self) -> Result<usize, RegistryError>;

    async fn list(&self) -> Result<Vec<WorkerRegistration>, RegistryError>;

    async fn count(&self) -> Result<usize, RegistryError> {
        Ok(self.list().await?.len())
    }
}
