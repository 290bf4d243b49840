//! The `GitProvider` trait every backend implements.

use async_trait::async_trait;

use crate::error::ScmResult;
use crate::types::{
    Backend, ChangeRequest, ChangeRequestFilter, ChangeRequestId, CommentId, FileChange, Issue,
    IssueFilter, IssueId, NewChangeRequest, NewIssue,
};

/// Normalized access to one repository on a git host.
///
/// Every mutation is either idempotent or reports a distinguishable
/// [`crate::ScmError::Conflict`] when the target already exists, so callers
/// can retry without duplicating side effects.
#[async_trait]
pub trait GitProvider: Send + Sync {
    /// Backend this provider talks to.
    fn backend(&self) -> Backend;

    /// Human-facing reference for an issue (`#42`).
    fn issue_reference(&self, id: &IssueId) -> String {
        format!("#{id}")
    }

    /// Human-facing reference for a change request (`#7`, `!7` on GitLab).
    fn change_request_reference(&self, id: &ChangeRequestId) -> String {
        format!("#{id}")
    }

    /// Fetch one issue. Fails with `NotFound` if it does not exist.
    async fn get_issue(&self, id: &IssueId) -> ScmResult<Issue>;

    /// List issues matching `filter`. Pull/merge requests are never returned.
    async fn list_issues(&self, filter: &IssueFilter) -> ScmResult<Vec<Issue>>;

    /// Post a comment on an issue.
    async fn add_comment(&self, id: &IssueId, body: &str) -> ScmResult<CommentId>;

    /// Add and remove labels. Where the backend cannot do both in one call,
    /// `add` is applied before `remove`. Removing an absent label succeeds.
    async fn set_labels(&self, id: &IssueId, add: &[String], remove: &[String]) -> ScmResult<()>;

    /// Create an issue and return its identifier.
    async fn create_issue(&self, issue: &NewIssue) -> ScmResult<IssueId>;

    /// Create `name` from `from_ref`. Fails with `Conflict` if it exists.
    async fn create_branch(&self, from_ref: &str, name: &str) -> ScmResult<()>;

    /// Create or overwrite `files` on `branch`.
    async fn commit_changes(
        &self,
        branch: &str,
        message: &str,
        files: &[FileChange],
    ) -> ScmResult<()>;

    /// Open a pull/merge request.
    async fn open_change_request(&self, request: &NewChangeRequest) -> ScmResult<ChangeRequestId>;

    /// List pull/merge requests matching `filter`.
    async fn list_change_requests(
        &self,
        filter: &ChangeRequestFilter,
    ) -> ScmResult<Vec<ChangeRequest>>;
}
