//! Backend-neutral types shared by every provider.
//!
//! Identifiers are opaque: they wrap whatever the backend hands out (a
//! repository-scoped issue number on GitHub and Gitea, a project-scoped `iid`
//! on GitLab) and are only ever handed back to the provider that produced
//! them. Nothing outside a provider parses or orders them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Git hosting backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    GitHub,
    GitLab,
    Gitea,
}

impl Backend {
    /// Lowercase name used in config files, logs and fingerprints.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GitHub => "github",
            Self::GitLab => "gitlab",
            Self::Gitea => "gitea",
        }
    }

    /// Backend's own word for a change request.
    #[must_use]
    pub fn change_request_noun(self) -> &'static str {
        match self {
            Self::GitLab => "merge request",
            Self::GitHub | Self::Gitea => "pull request",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "github" => Ok(Self::GitHub),
            "gitlab" => Ok(Self::GitLab),
            "gitea" | "forgejo" => Ok(Self::Gitea),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

/// Repository coordinates (`owner/name`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// `owner/name`
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Native representation, for handing back to the backend.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_string())
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }
    };
}

opaque_id!(
    /// Backend-native issue identifier (issue number or GitLab `iid`).
    IssueId
);
opaque_id!(
    /// Backend-native change request identifier (PR number or MR `iid`).
    ChangeRequestId
);
opaque_id!(
    /// Backend-native comment/note identifier.
    CommentId
);

/// Open/closed state of an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    Open,
    Closed,
}

/// An issue as seen by the workflow core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: IssueId,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub state: IssueState,
    /// Browser URL, when the backend returns one.
    #[serde(default)]
    pub url: Option<String>,
}

impl Issue {
    #[must_use]
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

/// Input for [`crate::GitProvider::create_issue`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewIssue {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

/// Issue listing filter. Labels are ANDed by every backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssueFilter {
    pub labels: Vec<String>,
    /// `None` lists only open issues.
    pub state: Option<IssueState>,
    pub limit: Option<u32>,
}

impl IssueFilter {
    /// Open issues carrying `label`.
    pub fn open_with_label(label: impl Into<String>) -> Self {
        Self {
            labels: vec![label.into()],
            state: Some(IssueState::Open),
            limit: None,
        }
    }
}

/// One file to create or overwrite in a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub content: String,
}

/// Input for [`crate::GitProvider::open_change_request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChangeRequest {
    pub source_branch: String,
    pub target_branch: String,
    pub title: String,
    pub body: String,
}

/// Lifecycle state of a change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeRequestState {
    Open,
    Merged,
    Closed,
}

/// A pull request (GitHub, Gitea) or merge request (GitLab).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub id: ChangeRequestId,
    pub source_branch: String,
    pub target_branch: String,
    pub state: ChangeRequestState,
    #[serde(default)]
    pub url: Option<String>,
}

/// Change request listing filter; unset fields do not filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeRequestFilter {
    pub source_branch: Option<String>,
    pub target_branch: Option<String>,
    pub state: Option<ChangeRequestState>,
}

impl ChangeRequestFilter {
    pub fn open_from(branch: impl Into<String>) -> Self {
        Self {
            source_branch: Some(branch.into()),
            target_branch: None,
            state: Some(ChangeRequestState::Open),
        }
    }

    pub fn from_branch(branch: impl Into<String>) -> Self {
        Self {
            source_branch: Some(branch.into()),
            target_branch: None,
            state: None,
        }
    }

    /// Client-side check for backends whose list endpoints cannot filter on
    /// every field.
    #[must_use]
    pub fn matches(&self, cr: &ChangeRequest) -> bool {
        self.source_branch
            .as_deref()
            .is_none_or(|b| b == cr.source_branch)
            && self
                .target_branch
                .as_deref()
                .is_none_or(|b| b == cr.target_branch)
            && self.state.is_none_or(|s| s == cr.state)
    }
}
