//! Gitea (and Forgejo) REST provider.
//!
//! Gitea addresses labels by numeric id, so label names are resolved against
//! the repository's label list on every mutation. Labels that do not exist
//! yet are created on first use.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{ScmError, ScmResult};
use crate::github::{auth_header, encode_path};
use crate::http::ApiClient;
use crate::provider::GitProvider;
use crate::types::{
    Backend, ChangeRequest, ChangeRequestFilter, ChangeRequestId, ChangeRequestState, CommentId,
    FileChange, Issue, IssueFilter, IssueId, IssueState, NewChangeRequest, NewIssue, RepoRef,
};

pub(crate) const GITEA_API_URL: &str = "https://gitea.com/api/v1";

const PAGE_SIZE: u32 = 50;
const MAX_PAGES: u32 = 20;
const NEW_LABEL_COLOR: &str = "#ededed";

#[derive(Debug, Clone, Deserialize)]
struct GtLabel {
    id: u64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct GtIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<GtLabel>,
    state: String,
    #[serde(default)]
    html_url: Option<String>,
    #[serde(default)]
    pull_request: Option<Value>,
}

impl From<GtIssue> for Issue {
    fn from(raw: GtIssue) -> Self {
        Self {
            id: IssueId::new(raw.number.to_string()),
            title: raw.title,
            body: raw.body.unwrap_or_default(),
            labels: raw.labels.into_iter().map(|l| l.name).collect(),
            state: if raw.state == "closed" {
                IssueState::Closed
            } else {
                IssueState::Open
            },
            url: raw.html_url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GtNumbered {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct GtComment {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct GtContent {
    sha: String,
}

#[derive(Debug, Serialize)]
struct GtFileOperation {
    operation: &'static str,
    path: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GtBranchRef {
    #[serde(rename = "ref")]
    ref_name: String,
}

#[derive(Debug, Deserialize)]
struct GtPull {
    number: u64,
    state: String,
    #[serde(default)]
    merged: bool,
    head: GtBranchRef,
    base: GtBranchRef,
    #[serde(default)]
    html_url: Option<String>,
}

impl From<GtPull> for ChangeRequest {
    fn from(raw: GtPull) -> Self {
        let state = match (raw.state.as_str(), raw.merged) {
            (_, true) => ChangeRequestState::Merged,
            ("closed", false) => ChangeRequestState::Closed,
            _ => ChangeRequestState::Open,
        };
        Self {
            id: ChangeRequestId::new(raw.number.to_string()),
            source_branch: raw.head.ref_name,
            target_branch: raw.base.ref_name,
            state,
            url: raw.html_url,
        }
    }
}

/// Gitea provider bound to one repository.
#[derive(Debug, Clone)]
pub struct GiteaProvider {
    api: ApiClient,
    repo: RepoRef,
}

impl GiteaProvider {
    /// Create a new Gitea provider. `base_url` is the `/api/v1` root.
    pub fn new(
        repo: RepoRef,
        token: &str,
        base_url: Option<&str>,
        timeout: Duration,
    ) -> ScmResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("labelflow/1.0"));
        headers.insert(AUTHORIZATION, auth_header(&format!("token {token}"))?);

        let api = ApiClient::new(base_url.unwrap_or(GITEA_API_URL), headers, timeout)?;
        Ok(Self { api, repo })
    }

    fn repo_path(&self) -> String {
        format!(
            "/repos/{}/{}",
            urlencoding::encode(&self.repo.owner),
            urlencoding::encode(&self.repo.name)
        )
    }

    async fn repo_labels(&self) -> ScmResult<HashMap<String, u64>> {
        let path = format!("{}/labels", self.repo_path());
        let mut labels = HashMap::new();

        for page in 1..=MAX_PAGES {
            let batch: Vec<GtLabel> = self
                .api
                .get_json(
                    &path,
                    &[("limit", PAGE_SIZE.to_string()), ("page", page.to_string())],
                )
                .await?;
            let exhausted = batch.len() < PAGE_SIZE as usize;
            labels.extend(batch.into_iter().map(|l| (l.name, l.id)));
            if exhausted {
                break;
            }
        }

        Ok(labels)
    }

    /// Resolve label names to ids, creating any that are missing.
    async fn ensure_label_ids(&self, names: &[String]) -> ScmResult<Vec<u64>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let mut known = self.repo_labels().await?;
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            if let Some(id) = known.get(name) {
                ids.push(*id);
                continue;
            }

            let path = format!("{}/labels", self.repo_path());
            let created: GtLabel = self
                .api
                .send_json(
                    Method::POST,
                    &path,
                    &json!({ "name": name, "color": NEW_LABEL_COLOR }),
                )
                .await?;
            info!(repo = %self.repo, label = %name, "Created Gitea label");
            known.insert(created.name, created.id);
            ids.push(created.id);
        }

        Ok(ids)
    }

    async fn file_sha(&self, branch: &str, path: &str) -> ScmResult<Option<String>> {
        let url = format!("{}/contents/{}", self.repo_path(), encode_path(path));
        match self
            .api
            .get_json::<GtContent>(&url, &[("ref", branch.to_string())])
            .await
        {
            Ok(content) => Ok(Some(content.sha)),
            Err(ScmError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl GitProvider for GiteaProvider {
    fn backend(&self) -> Backend {
        Backend::Gitea
    }

    async fn get_issue(&self, id: &IssueId) -> ScmResult<Issue> {
        let path = format!("{}/issues/{}", self.repo_path(), id);
        let raw: GtIssue = self.api.get_json(&path, &[]).await.map_err(|e| match e {
            ScmError::NotFound(_) => ScmError::NotFound(format!("issue {id}")),
            other => other,
        })?;
        Ok(raw.into())
    }

    async fn list_issues(&self, filter: &IssueFilter) -> ScmResult<Vec<Issue>> {
        let path = format!("{}/issues", self.repo_path());
        let limit = filter.limit.unwrap_or(PAGE_SIZE * MAX_PAGES) as usize;
        let state = match filter.state {
            Some(IssueState::Open) | None => "open",
            Some(IssueState::Closed) => "closed",
        };
        let mut issues = Vec::new();

        for page in 1..=MAX_PAGES {
            let mut query = vec![
                ("state", state.to_string()),
                ("type", "issues".to_string()),
                ("limit", PAGE_SIZE.to_string()),
                ("page", page.to_string()),
            ];
            if !filter.labels.is_empty() {
                query.push(("labels", filter.labels.join(",")));
            }

            let batch: Vec<GtIssue> = self.api.get_json(&path, &query).await?;
            let exhausted = batch.len() < PAGE_SIZE as usize;
            issues.extend(
                batch
                    .into_iter()
                    .filter(|i| i.pull_request.is_none())
                    .map(Issue::from),
            );

            if exhausted || issues.len() >= limit {
                break;
            }
        }

        issues.truncate(limit);
        Ok(issues)
    }

    async fn add_comment(&self, id: &IssueId, body: &str) -> ScmResult<CommentId> {
        let path = format!("{}/issues/{}/comments", self.repo_path(), id);
        let comment: GtComment = self
            .api
            .send_json(Method::POST, &path, &json!({ "body": body }))
            .await?;
        debug!(issue = %id, comment_id = comment.id, "Posted Gitea comment");
        Ok(CommentId::new(comment.id.to_string()))
    }

    async fn set_labels(&self, id: &IssueId, add: &[String], remove: &[String]) -> ScmResult<()> {
        if !add.is_empty() {
            let ids = self.ensure_label_ids(add).await?;
            let path = format!("{}/issues/{}/labels", self.repo_path(), id);
            let _: Value = self
                .api
                .send_json(Method::POST, &path, &json!({ "labels": ids }))
                .await?;
        }

        if !remove.is_empty() {
            let known = self.repo_labels().await?;
            for name in remove {
                // A label the repository doesn't have can't be on the issue.
                let Some(label_id) = known.get(name) else {
                    continue;
                };
                let path = format!("{}/issues/{}/labels/{}", self.repo_path(), id, label_id);
                match self.api.send_empty::<Value>(Method::DELETE, &path, None).await {
                    Ok(()) | Err(ScmError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(())
    }

    async fn create_issue(&self, issue: &NewIssue) -> ScmResult<IssueId> {
        let label_ids = self.ensure_label_ids(&issue.labels).await?;
        let path = format!("{}/issues", self.repo_path());
        let created: GtNumbered = self
            .api
            .send_json(
                Method::POST,
                &path,
                &json!({
                    "title": issue.title,
                    "body": issue.body,
                    "labels": label_ids,
                }),
            )
            .await?;
        info!(repo = %self.repo, number = created.number, "Created Gitea issue");
        Ok(IssueId::new(created.number.to_string()))
    }

    async fn create_branch(&self, from_ref: &str, name: &str) -> ScmResult<()> {
        let path = format!("{}/branches", self.repo_path());
        let _: Value = self
            .api
            .send_json(
                Method::POST,
                &path,
                &json!({
                    "new_branch_name": name,
                    "old_branch_name": from_ref,
                }),
            )
            .await?;
        info!(repo = %self.repo, branch = %name, from = %from_ref, "Created Gitea branch");
        Ok(())
    }

    async fn commit_changes(
        &self,
        branch: &str,
        message: &str,
        files: &[FileChange],
    ) -> ScmResult<()> {
        let mut operations = Vec::with_capacity(files.len());
        for file in files {
            let sha = self.file_sha(branch, &file.path).await?;
            operations.push(GtFileOperation {
                operation: if sha.is_some() { "update" } else { "create" },
                path: file.path.clone(),
                content: BASE64.encode(file.content.as_bytes()),
                sha,
            });
        }

        let path = format!("{}/contents", self.repo_path());
        let _: Value = self
            .api
            .send_json(
                Method::POST,
                &path,
                &json!({
                    "branch": branch,
                    "message": message,
                    "files": operations,
                }),
            )
            .await?;
        debug!(branch = %branch, files = files.len(), "Committed files to Gitea");
        Ok(())
    }

    async fn open_change_request(&self, request: &NewChangeRequest) -> ScmResult<ChangeRequestId> {
        let path = format!("{}/pulls", self.repo_path());
        let created: GtNumbered = self
            .api
            .send_json(
                Method::POST,
                &path,
                &json!({
                    "head": request.source_branch,
                    "base": request.target_branch,
                    "title": request.title,
                    "body": request.body,
                }),
            )
            .await?;
        info!(repo = %self.repo, number = created.number, "Opened Gitea pull request");
        Ok(ChangeRequestId::new(created.number.to_string()))
    }

    async fn list_change_requests(
        &self,
        filter: &ChangeRequestFilter,
    ) -> ScmResult<Vec<ChangeRequest>> {
        let path = format!("{}/pulls", self.repo_path());
        let state = match filter.state {
            Some(ChangeRequestState::Open) => "open",
            Some(ChangeRequestState::Merged | ChangeRequestState::Closed) => "closed",
            None => "all",
        };

        let mut found = Vec::new();
        for page in 1..=MAX_PAGES {
            let batch: Vec<GtPull> = self
                .api
                .get_json(
                    &path,
                    &[
                        ("state", state.to_string()),
                        ("limit", PAGE_SIZE.to_string()),
                        ("page", page.to_string()),
                    ],
                )
                .await?;
            let exhausted = batch.len() < PAGE_SIZE as usize;
            // The list endpoint has no branch filters.
            found.extend(
                batch
                    .into_iter()
                    .map(ChangeRequest::from)
                    .filter(|cr| filter.matches(cr)),
            );
            if exhausted {
                break;
            }
        }

        Ok(found)
    }
}
