//! In-process record store for tests and dry runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use scm::{IssueId, RepoRef};
use tokio::sync::RwLock;

use super::{StateStore, StoreError, StoreResult};
use crate::record::{RecordKey, WorkflowRecord};

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<RwLock<HashMap<RecordKey, WorkflowRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    fn storage_type(&self) -> &'static str {
        "memory"
    }

    async fn load(&self, key: &RecordKey) -> StoreResult<Option<WorkflowRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn find_by_issue(
        &self,
        repository: &RepoRef,
        issue: &IssueId,
    ) -> StoreResult<Option<WorkflowRecord>> {
        let records = self.records.read().await;
        let direct = RecordKey::new(repository.clone(), issue.clone());
        if let Some(record) = records.get(&direct) {
            return Ok(Some(record.clone()));
        }
        Ok(records
            .values()
            .find(|r| r.repository == *repository && r.contains_issue(issue))
            .cloned())
    }

    async fn save(&self, record: &mut WorkflowRecord) -> StoreResult<()> {
        let key = record.key();
        let mut records = self.records.write().await;

        let stored = records.get(&key).map_or(0, |r| r.version);
        if stored != record.version {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                expected: record.version,
                found: stored,
            });
        }

        record.version += 1;
        record.updated_at = Utc::now();
        records.insert(key, record.clone());
        Ok(())
    }

    async fn list(&self, repository: &RepoRef) -> StoreResult<Vec<WorkflowRecord>> {
        let mut records: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.repository == *repository)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }
}
