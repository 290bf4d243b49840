//! GitHub REST v3 provider.

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
use crate::http::ApiClient;
use crate::provider::GitProvider;
use crate::types::{
    Backend, ChangeRequest, ChangeRequestFilter, ChangeRequestId, ChangeRequestState, CommentId,
    FileChange, Issue, IssueFilter, IssueId, IssueState, NewChangeRequest, NewIssue, RepoRef,
};

pub(crate) const GITHUB_API_URL: &str = "https://api.github.com";

const PAGE_SIZE: u32 = 100;
const MAX_PAGES: u32 = 10;

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<GhLabel>,
    state: String,
    #[serde(default)]
    html_url: Option<String>,
    /// Present when the "issue" is actually a pull request.
    #[serde(default)]
    pull_request: Option<Value>,
}

impl From<GhIssue> for Issue {
    fn from(raw: GhIssue) -> Self {
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
struct GhNumbered {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct GhComment {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct GhRefObject {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GhRef {
    object: GhRefObject,
}

#[derive(Debug, Deserialize)]
struct GhContent {
    sha: String,
}

#[derive(Debug, Serialize)]
struct PutContentRequest<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GhBranchRef {
    #[serde(rename = "ref")]
    ref_name: String,
}

#[derive(Debug, Deserialize)]
struct GhPull {
    number: u64,
    state: String,
    #[serde(default)]
    merged_at: Option<String>,
    head: GhBranchRef,
    base: GhBranchRef,
    #[serde(default)]
    html_url: Option<String>,
}

impl From<GhPull> for ChangeRequest {
    fn from(raw: GhPull) -> Self {
        let state = match (raw.state.as_str(), raw.merged_at.is_some()) {
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

/// GitHub provider bound to one repository.
#[derive(Debug, Clone)]
pub struct GitHubProvider {
    api: ApiClient,
    repo: RepoRef,
}

impl GitHubProvider {
    /// Create a new GitHub provider.
    ///
    /// `base_url` overrides the public API root (GitHub Enterprise, tests).
    pub fn new(
        repo: RepoRef,
        token: &str,
        base_url: Option<&str>,
        timeout: Duration,
    ) -> ScmResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static("2022-11-28"),
        );
        headers.insert(USER_AGENT, HeaderValue::from_static("labelflow/1.0"));
        headers.insert(AUTHORIZATION, auth_header(&format!("Bearer {token}"))?);

        let api = ApiClient::new(base_url.unwrap_or(GITHUB_API_URL), headers, timeout)?;
        Ok(Self { api, repo })
    }

    fn repo_path(&self) -> String {
        format!(
            "/repos/{}/{}",
            urlencoding::encode(&self.repo.owner),
            urlencoding::encode(&self.repo.name)
        )
    }

    async fn file_sha(&self, branch: &str, path: &str) -> ScmResult<Option<String>> {
        let url = format!("{}/contents/{}", self.repo_path(), encode_path(path));
        match self
            .api
            .get_json::<GhContent>(&url, &[("ref", branch.to_string())])
            .await
        {
            Ok(content) => Ok(Some(content.sha)),
            Err(ScmError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

pub(crate) fn auth_header(value: &str) -> ScmResult<HeaderValue> {
    let mut header = HeaderValue::from_str(value).map_err(|_| ScmError::Permission {
        status: 0,
        message: "token contains characters not allowed in an HTTP header".to_string(),
    })?;
    header.set_sensitive(true);
    Ok(header)
}

/// Percent-encode each path segment, keeping the separators.
pub(crate) fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn state_param(state: Option<IssueState>) -> &'static str {
    match state {
        Some(IssueState::Open) | None => "open",
        Some(IssueState::Closed) => "closed",
    }
}

#[async_trait]
impl GitProvider for GitHubProvider {
    fn backend(&self) -> Backend {
        Backend::GitHub
    }

    async fn get_issue(&self, id: &IssueId) -> ScmResult<Issue> {
        let path = format!("{}/issues/{}", self.repo_path(), id);
        let raw: GhIssue = self.api.get_json(&path, &[]).await.map_err(|e| match e {
            ScmError::NotFound(_) => ScmError::NotFound(format!("issue {id}")),
            other => other,
        })?;
        Ok(raw.into())
    }

    async fn list_issues(&self, filter: &IssueFilter) -> ScmResult<Vec<Issue>> {
        let path = format!("{}/issues", self.repo_path());
        let limit = filter.limit.unwrap_or(PAGE_SIZE * MAX_PAGES) as usize;
        let mut issues = Vec::new();

        for page in 1..=MAX_PAGES {
            let mut query = vec![
                ("state", state_param(filter.state).to_string()),
                ("per_page", PAGE_SIZE.to_string()),
                ("page", page.to_string()),
            ];
            if !filter.labels.is_empty() {
                query.push(("labels", filter.labels.join(",")));
            }

            let batch: Vec<GhIssue> = self.api.get_json(&path, &query).await?;
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
        let comment: GhComment = self
            .api
            .send_json(Method::POST, &path, &json!({ "body": body }))
            .await?;
        debug!(issue = %id, comment_id = comment.id, "Posted GitHub comment");
        Ok(CommentId::new(comment.id.to_string()))
    }

    async fn set_labels(&self, id: &IssueId, add: &[String], remove: &[String]) -> ScmResult<()> {
        // GitHub has no single add+remove call; add first so a trigger is never
        // lost between the two requests.
        if !add.is_empty() {
            let path = format!("{}/issues/{}/labels", self.repo_path(), id);
            let _: Value = self
                .api
                .send_json(Method::POST, &path, &json!({ "labels": add }))
                .await?;
        }

        for label in remove {
            let path = format!(
                "{}/issues/{}/labels/{}",
                self.repo_path(),
                id,
                urlencoding::encode(label)
            );
            match self.api.send_empty::<Value>(Method::DELETE, &path, None).await {
                Ok(()) | Err(ScmError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    async fn create_issue(&self, issue: &NewIssue) -> ScmResult<IssueId> {
        let path = format!("{}/issues", self.repo_path());
        let created: GhNumbered = self
            .api
            .send_json(
                Method::POST,
                &path,
                &json!({
                    "title": issue.title,
                    "body": issue.body,
                    "labels": issue.labels,
                }),
            )
            .await?;
        info!(repo = %self.repo, number = created.number, "Created GitHub issue");
        Ok(IssueId::new(created.number.to_string()))
    }

    async fn create_branch(&self, from_ref: &str, name: &str) -> ScmResult<()> {
        let base_path = format!("{}/git/ref/heads/{}", self.repo_path(), encode_path(from_ref));
        let base: GhRef = self.api.get_json(&base_path, &[]).await?;

        let path = format!("{}/git/refs", self.repo_path());
        let _: Value = self
            .api
            .send_json(
                Method::POST,
                &path,
                &json!({
                    "ref": format!("refs/heads/{name}"),
                    "sha": base.object.sha,
                }),
            )
            .await?;
        info!(repo = %self.repo, branch = %name, from = %from_ref, "Created GitHub branch");
        Ok(())
    }

    async fn commit_changes(
        &self,
        branch: &str,
        message: &str,
        files: &[FileChange],
    ) -> ScmResult<()> {
        // The contents API commits one file per request.
        for file in files {
            let sha = self.file_sha(branch, &file.path).await?;
            let path = format!("{}/contents/{}", self.repo_path(), encode_path(&file.path));
            let request = PutContentRequest {
                message,
                content: BASE64.encode(file.content.as_bytes()),
                branch,
                sha,
            };
            let _: Value = self.api.send_json(Method::PUT, &path, &request).await?;
            debug!(branch = %branch, file = %file.path, "Committed file to GitHub");
        }
        Ok(())
    }

    async fn open_change_request(&self, request: &NewChangeRequest) -> ScmResult<ChangeRequestId> {
        let path = format!("{}/pulls", self.repo_path());
        let created: GhNumbered = self
            .api
            .send_json(
                Method::POST,
                &path,
                &json!({
                    "title": request.title,
                    "head": request.source_branch,
                    "base": request.target_branch,
                    "body": request.body,
                }),
            )
            .await?;
        info!(repo = %self.repo, number = created.number, "Opened GitHub pull request");
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

        let mut query = vec![
            ("state", state.to_string()),
            ("per_page", PAGE_SIZE.to_string()),
        ];
        if let Some(branch) = &filter.source_branch {
            query.push(("head", format!("{}:{branch}", self.repo.owner)));
        }
        if let Some(branch) = &filter.target_branch {
            query.push(("base", branch.clone()));
        }

        let pulls: Vec<GhPull> = self.api.get_json(&path, &query).await?;
        Ok(pulls
            .into_iter()
            .map(ChangeRequest::from)
            .filter(|cr| filter.matches(cr))
            .collect())
    }
}
