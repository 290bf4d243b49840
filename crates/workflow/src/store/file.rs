//! JSON-file record store: `<dir>/<owner>/<name>/<root-issue>.json`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use scm::{IssueId, RepoRef};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{StateStore, StoreError, StoreResult};
use crate::record::{RecordKey, WorkflowRecord};

/// File-backed store. Writes go to a temp file that is renamed over the
/// record, so readers never observe a partial record.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    // Serializes the version check and rename of concurrent saves
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn repo_dir(&self, repository: &RepoRef) -> PathBuf {
        self.root
            .join(sanitize(&repository.owner))
            .join(sanitize(&repository.name))
    }

    fn record_path(&self, key: &RecordKey) -> PathBuf {
        self.repo_dir(&key.repository)
            .join(format!("{}.json", sanitize(key.root_issue.as_str())))
    }

    async fn read_record(path: &Path) -> StoreResult<Option<WorkflowRecord>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
    }
}

/// Identifiers are opaque, so anything outside a conservative set becomes `_`.
fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        format!("_{cleaned}")
    } else {
        cleaned
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl StateStore for FileStore {
    fn storage_type(&self) -> &'static str {
        "file"
    }

    async fn load(&self, key: &RecordKey) -> StoreResult<Option<WorkflowRecord>> {
        Self::read_record(&self.record_path(key)).await
    }

    async fn find_by_issue(
        &self,
        repository: &RepoRef,
        issue: &IssueId,
    ) -> StoreResult<Option<WorkflowRecord>> {
        let direct = RecordKey::new(repository.clone(), issue.clone());
        if let Some(record) = self.load(&direct).await? {
            return Ok(Some(record));
        }

        Ok(self
            .list(repository)
            .await?
            .into_iter()
            .find(|record| record.contains_issue(issue)))
    }

    async fn save(&self, record: &mut WorkflowRecord) -> StoreResult<()> {
        let key = record.key();
        let path = self.record_path(&key);
        let _guard = self.write_lock.lock().await;

        let stored = Self::read_record(&path).await?.map_or(0, |r| r.version);
        if stored != record.version {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                expected: record.version,
                found: stored,
            });
        }

        let previous = (record.version, record.updated_at);
        record.version += 1;
        record.updated_at = Utc::now();

        let result = async {
            let dir = self.repo_dir(&key.repository);
            tokio::fs::create_dir_all(&dir).await.map_err(io_error(&dir))?;

            let content =
                serde_json::to_string_pretty(&*record).map_err(|e| StoreError::Corrupt {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
            let tmp = path.with_extension(format!("json.tmp.{}", std::process::id()));
            tokio::fs::write(&tmp, content).await.map_err(io_error(&tmp))?;
            tokio::fs::rename(&tmp, &path).await.map_err(io_error(&path))
        }
        .await;

        if let Err(e) = result {
            (record.version, record.updated_at) = previous;
            return Err(e);
        }

        debug!(record = %key, version = record.version, stage = %record.stage, "Saved workflow record");
        Ok(())
    }

    async fn list(&self, repository: &RepoRef) -> StoreResult<Vec<WorkflowRecord>> {
        let dir = self.repo_dir(repository);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: dir.display().to_string(),
                    source,
                })
            }
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error(&dir))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e @ StoreError::Corrupt { .. }) => {
                    warn!(error = %e, "Skipping unreadable workflow record");
                }
                Err(e) => return Err(e),
            }
        }

        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }
}
