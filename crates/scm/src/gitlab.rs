//! GitLab REST v4 provider.
//!
//! Issues and merge requests are addressed by their project-scoped `iid`; the
//! project itself by its URL-encoded `owner/name` path.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{ScmError, ScmResult};
use crate::github::auth_header;
use crate::http::ApiClient;
use crate::provider::GitProvider;
use crate::types::{
    Backend, ChangeRequest, ChangeRequestFilter, ChangeRequestId, ChangeRequestState, CommentId,
    FileChange, Issue, IssueFilter, IssueId, IssueState, NewChangeRequest, NewIssue, RepoRef,
};

pub(crate) const GITLAB_API_URL: &str = "https://gitlab.com/api/v4";

const PAGE_SIZE: u32 = 100;
const MAX_PAGES: u32 = 10;

#[derive(Debug, Deserialize)]
struct GlIssue {
    iid: u64,
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    labels: Vec<String>,
    state: String,
    #[serde(default)]
    web_url: Option<String>,
}

impl From<GlIssue> for Issue {
    fn from(raw: GlIssue) -> Self {
        Self {
            id: IssueId::new(raw.iid.to_string()),
            title: raw.title,
            body: raw.description.unwrap_or_default(),
            labels: raw.labels,
            state: if raw.state == "closed" {
                IssueState::Closed
            } else {
                IssueState::Open
            },
            url: raw.web_url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GlIid {
    iid: u64,
}

#[derive(Debug, Deserialize)]
struct GlNote {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct GlMergeRequest {
    iid: u64,
    source_branch: String,
    target_branch: String,
    state: String,
    #[serde(default)]
    web_url: Option<String>,
}

impl From<GlMergeRequest> for ChangeRequest {
    fn from(raw: GlMergeRequest) -> Self {
        let state = match raw.state.as_str() {
            "merged" => ChangeRequestState::Merged,
            "closed" | "locked" => ChangeRequestState::Closed,
            _ => ChangeRequestState::Open,
        };
        Self {
            id: ChangeRequestId::new(raw.iid.to_string()),
            source_branch: raw.source_branch,
            target_branch: raw.target_branch,
            state,
            url: raw.web_url,
        }
    }
}

#[derive(Debug, Serialize)]
struct CommitAction<'a> {
    action: &'static str,
    file_path: &'a str,
    content: &'a str,
}

/// GitLab provider bound to one project.
#[derive(Debug, Clone)]
pub struct GitLabProvider {
    api: ApiClient,
    repo: RepoRef,
}

impl GitLabProvider {
    /// Create a new GitLab provider. `base_url` is the `/api/v4` root.
    pub fn new(
        repo: RepoRef,
        token: &str,
        base_url: Option<&str>,
        timeout: Duration,
    ) -> ScmResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("labelflow/1.0"));
        headers.insert("PRIVATE-TOKEN", auth_header(token)?);

        let api = ApiClient::new(base_url.unwrap_or(GITLAB_API_URL), headers, timeout)?;
        Ok(Self { api, repo })
    }

    fn project_path(&self) -> String {
        format!(
            "/projects/{}",
            urlencoding::encode(&self.repo.full_name())
        )
    }

    async fn file_exists(&self, branch: &str, path: &str) -> ScmResult<bool> {
        let url = format!(
            "{}/repository/files/{}",
            self.project_path(),
            urlencoding::encode(path)
        );
        match self
            .api
            .get_json::<Value>(&url, &[("ref", branch.to_string())])
            .await
        {
            Ok(_) => Ok(true),
            Err(ScmError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn issue_state_param(state: Option<IssueState>) -> &'static str {
    match state {
        Some(IssueState::Open) | None => "opened",
        Some(IssueState::Closed) => "closed",
    }
}

#[async_trait]
impl GitProvider for GitLabProvider {
    fn backend(&self) -> Backend {
        Backend::GitLab
    }

    fn change_request_reference(&self, id: &ChangeRequestId) -> String {
        format!("!{id}")
    }

    async fn get_issue(&self, id: &IssueId) -> ScmResult<Issue> {
        let path = format!("{}/issues/{}", self.project_path(), id);
        let raw: GlIssue = self.api.get_json(&path, &[]).await.map_err(|e| match e {
            ScmError::NotFound(_) => ScmError::NotFound(format!("issue {id}")),
            other => other,
        })?;
        Ok(raw.into())
    }

    async fn list_issues(&self, filter: &IssueFilter) -> ScmResult<Vec<Issue>> {
        let path = format!("{}/issues", self.project_path());
        let limit = filter.limit.unwrap_or(PAGE_SIZE * MAX_PAGES) as usize;
        let mut issues = Vec::new();

        for page in 1..=MAX_PAGES {
            let mut query = vec![
                ("state", issue_state_param(filter.state).to_string()),
                ("per_page", PAGE_SIZE.to_string()),
                ("page", page.to_string()),
            ];
            if !filter.labels.is_empty() {
                query.push(("labels", filter.labels.join(",")));
            }

            let batch: Vec<GlIssue> = self.api.get_json(&path, &query).await?;
            let exhausted = batch.len() < PAGE_SIZE as usize;
            issues.extend(batch.into_iter().map(Issue::from));

            if exhausted || issues.len() >= limit {
                break;
            }
        }

        issues.truncate(limit);
        Ok(issues)
    }

    async fn add_comment(&self, id: &IssueId, body: &str) -> ScmResult<CommentId> {
        let path = format!("{}/issues/{}/notes", self.project_path(), id);
        let note: GlNote = self
            .api
            .send_json(Method::POST, &path, &json!({ "body": body }))
            .await?;
        debug!(issue = %id, note_id = note.id, "Posted GitLab note");
        Ok(CommentId::new(note.id.to_string()))
    }

    async fn set_labels(&self, id: &IssueId, add: &[String], remove: &[String]) -> ScmResult<()> {
        if add.is_empty() && remove.is_empty() {
            return Ok(());
        }

        // One request carries both lists, so GitLab applies them atomically.
        let path = format!("{}/issues/{}", self.project_path(), id);
        let _: Value = self
            .api
            .send_json(
                Method::PUT,
                &path,
                &json!({
                    "add_labels": add.join(","),
                    "remove_labels": remove.join(","),
                }),
            )
            .await?;
        Ok(())
    }

    async fn create_issue(&self, issue: &NewIssue) -> ScmResult<IssueId> {
        let path = format!("{}/issues", self.project_path());
        let created: GlIid = self
            .api
            .send_json(
                Method::POST,
                &path,
                &json!({
                    "title": issue.title,
                    "description": issue.body,
                    "labels": issue.labels.join(","),
                }),
            )
            .await?;
        info!(repo = %self.repo, iid = created.iid, "Created GitLab issue");
        Ok(IssueId::new(created.iid.to_string()))
    }

    async fn create_branch(&self, from_ref: &str, name: &str) -> ScmResult<()> {
        let path = format!("{}/repository/branches", self.project_path());
        let _: Value = self
            .api
            .send_query(
                Method::POST,
                &path,
                &[("branch", name.to_string()), ("ref", from_ref.to_string())],
            )
            .await?;
        info!(repo = %self.repo, branch = %name, from = %from_ref, "Created GitLab branch");
        Ok(())
    }

    async fn commit_changes(
        &self,
        branch: &str,
        message: &str,
        files: &[FileChange],
    ) -> ScmResult<()> {
        let mut actions = Vec::with_capacity(files.len());
        for file in files {
            let action = if self.file_exists(branch, &file.path).await? {
                "update"
            } else {
                "create"
            };
            actions.push(CommitAction {
                action,
                file_path: &file.path,
                content: &file.content,
            });
        }

        let path = format!("{}/repository/commits", self.project_path());
        let _: Value = self
            .api
            .send_json(
                Method::POST,
                &path,
                &json!({
                    "branch": branch,
                    "commit_message": message,
                    "actions": actions,
                }),
            )
            .await?;
        debug!(branch = %branch, files = files.len(), "Committed files to GitLab");
        Ok(())
    }

    async fn open_change_request(&self, request: &NewChangeRequest) -> ScmResult<ChangeRequestId> {
        let path = format!("{}/merge_requests", self.project_path());
        let created: GlIid = self
            .api
            .send_json(
                Method::POST,
                &path,
                &json!({
                    "source_branch": request.source_branch,
                    "target_branch": request.target_branch,
                    "title": request.title,
                    "description": request.body,
                }),
            )
            .await?;
        info!(repo = %self.repo, iid = created.iid, "Opened GitLab merge request");
        Ok(ChangeRequestId::new(created.iid.to_string()))
    }

    async fn list_change_requests(
        &self,
        filter: &ChangeRequestFilter,
    ) -> ScmResult<Vec<ChangeRequest>> {
        let path = format!("{}/merge_requests", self.project_path());
        let state = match filter.state {
            Some(ChangeRequestState::Open) => "opened",
            Some(ChangeRequestState::Merged) => "merged",
            Some(ChangeRequestState::Closed) => "closed",
            None => "all",
        };

        let mut query = vec![
            ("state", state.to_string()),
            ("per_page", PAGE_SIZE.to_string()),
        ];
        if let Some(branch) = &filter.source_branch {
            query.push(("source_branch", branch.clone()));
        }
        if let Some(branch) = &filter.target_branch {
            query.push(("target_branch", branch.clone()));
        }

        let mrs: Vec<GlMergeRequest> = self.api.get_json(&path, &query).await?;
        Ok(mrs
            .into_iter()
            .map(ChangeRequest::from)
            .filter(|cr| filter.matches(cr))
            .collect())
    }
}
