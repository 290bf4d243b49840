//! Unified SCM abstraction.
//!
//! One [`GitProvider`] trait over GitHub, GitLab and Gitea so the workflow
//! engine never sees backend-specific payloads:
//!
//! - [`GitHubProvider`] - REST v3, bearer token
//! - [`GitLabProvider`] - REST v4, `PRIVATE-TOKEN`, merge requests
//! - [`GiteaProvider`] - `/api/v1`, `token` auth, label ids resolved by name
//!
//! Use [`connect`] to build the provider from [`ProviderSettings`].

pub mod error;
pub mod factory;
pub mod gitea;
pub mod github;
pub mod gitlab;
mod http;
pub mod provider;
pub mod types;

pub use error::{ScmError, ScmResult};
pub use factory::{connect, ProviderSettings};
pub use gitea::GiteaProvider;
pub use github::GitHubProvider;
pub use gitlab::GitLabProvider;
pub use provider::GitProvider;
pub use types::{
    Backend, ChangeRequest, ChangeRequestFilter, ChangeRequestId, ChangeRequestState, CommentId,
    FileChange, Issue, IssueFilter, IssueId, IssueState, NewChangeRequest, NewIssue, RepoRef,
};
