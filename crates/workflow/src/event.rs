//! Inbound label events and their delivery fingerprints.

use std::fmt;
use std::str::FromStr;

use scm::{Backend, IssueId, RepoRef};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Direction of a label change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelAction {
    Added,
    Removed,
}

impl LabelAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Removed => "removed",
        }
    }
}

impl fmt::Display for LabelAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LabelAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "labeled" | "added" | "add" => Ok(Self::Added),
            "unlabeled" | "removed" | "remove" => Ok(Self::Removed),
            other => Err(format!(
                "unknown event type '{other}' (expected labeled or unlabeled)"
            )),
        }
    }
}

/// A label was added to or removed from an issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEvent {
    pub backend: Backend,
    pub repository: RepoRef,
    pub issue: IssueId,
    pub label: String,
    pub action: LabelAction,
}

impl LabelEvent {
    pub fn added(
        backend: Backend,
        repository: RepoRef,
        issue: IssueId,
        label: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            repository,
            issue,
            label: label.into(),
            action: LabelAction::Added,
        }
    }

    pub fn removed(
        backend: Backend,
        repository: RepoRef,
        issue: IssueId,
        label: impl Into<String>,
    ) -> Self {
        Self {
            action: LabelAction::Removed,
            ..Self::added(backend, repository, issue, label)
        }
    }

    /// The same change for another label of the issue.
    pub fn with_label(&self, label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..self.clone()
        }
    }

    /// Stable identity of this delivery: SHA-256 over backend, repository,
    /// issue, label and direction.
    pub fn fingerprint(&self) -> String {
        self.fingerprint_for(self.action)
    }

    /// Fingerprint of the same label change in the given direction.
    pub fn fingerprint_for(&self, action: LabelAction) -> String {
        let repository = self.repository.full_name();
        let parts: [&str; 5] = [
            self.backend.as_str(),
            &repository,
            self.issue.as_str(),
            &self.label,
            action.as_str(),
        ];

        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update(b"|");
        }
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for LabelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} '{}' on {}#{}",
            self.action, self.label, self.repository, self.issue
        )
    }
}
