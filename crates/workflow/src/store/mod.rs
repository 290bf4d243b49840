//! Durable workflow records.
//!
//! [`StateStore`] is the only shared mutable resource of the engine. Callers
//! read and write a record while holding that record's lock; the store itself
//! still rejects stale writes through the record `version`.

mod file;
mod memory;

use async_trait::async_trait;
use scm::{IssueId, RepoRef};
use thiserror::Error;

use crate::error::ErrorClass;
use crate::record::{RecordKey, WorkflowRecord};

pub use file::FileStore;
pub use memory::MemoryStore;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("workflow record {path} is unreadable: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("workflow record {key} changed concurrently (expected version {expected}, found {found})")]
    Conflict {
        key: String,
        expected: u64,
        found: u64,
    },
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Io { .. } => ErrorClass::Transient,
            Self::Corrupt { .. } => ErrorClass::Configuration,
            Self::Conflict { .. } => ErrorClass::StateConflict,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Storage interface for workflow records.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Storage type identifier, for logs
    fn storage_type(&self) -> &'static str;

    /// Load the record for a root issue.
    async fn load(&self, key: &RecordKey) -> StoreResult<Option<WorkflowRecord>>;

    /// Find the record any of whose member issues is `issue`.
    async fn find_by_issue(
        &self,
        repository: &RepoRef,
        issue: &IssueId,
    ) -> StoreResult<Option<WorkflowRecord>>;

    /// Persist `record` if its `version` matches the stored one, then bump
    /// the version and `updated_at` in place.
    async fn save(&self, record: &mut WorkflowRecord) -> StoreResult<()>;

    /// All records of a repository.
    async fn list(&self, repository: &RepoRef) -> StoreResult<Vec<WorkflowRecord>>;
}
