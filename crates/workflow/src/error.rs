//! Workflow error types and their classification.

use std::fmt;
use std::time::Duration;

use ai::AiError;
use scm::ScmError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::store::StoreError;

/// Result type alias for workflow operations.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Failure classes that decide retry and reporting behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad or missing configuration; fatal before any work starts
    Configuration,
    /// Referenced issue or resource does not exist
    NotFound,
    /// Timeout, connection failure, 5xx, rate limit
    Transient,
    /// Credentials lack the required scope
    Permission,
    /// The agent failed to produce usable output
    AgentGeneration,
    /// Concurrent modification of a workflow record
    StateConflict,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::NotFound => "not_found",
            Self::Transient => "transient",
            Self::Permission => "permission",
            Self::AgentGeneration => "agent_generation",
            Self::StateConflict => "state_conflict",
        }
    }

    /// Whether a later delivery of the same event may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::StateConflict)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while processing a label event.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Scm(#[from] ScmError),

    #[error(transparent)]
    Ai(#[from] AiError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// An adapter or agent call exceeded its deadline
    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// A precondition on the record or issue does not hold
    #[error("not found: {0}")]
    NotFound(String),

    /// The record an issue belongs to kept moving while being locked
    #[error("workflow record for {0} changed while locking")]
    Contended(String),
}

impl WorkflowError {
    /// Map onto the failure taxonomy. Handlers and the orchestrator use this
    /// single mapping; nothing reclassifies afterwards.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Config(_) => ErrorClass::Configuration,
            Self::Scm(e) => match e {
                ScmError::NotFound(_) => ErrorClass::NotFound,
                ScmError::Conflict(_) => ErrorClass::StateConflict,
                ScmError::Permission { .. } | ScmError::Rejected { .. } => ErrorClass::Permission,
                ScmError::RateLimited { .. }
                | ScmError::Transient(_)
                | ScmError::InvalidResponse(_) => ErrorClass::Transient,
            },
            Self::Ai(e) => match e {
                AiError::NotConfigured { .. } | AiError::UnknownProvider(_) => {
                    ErrorClass::Configuration
                }
                e if e.is_transient() => ErrorClass::Transient,
                _ => ErrorClass::AgentGeneration,
            },
            Self::Store(e) => e.class(),
            Self::Timeout { .. } => ErrorClass::Transient,
            Self::NotFound(_) => ErrorClass::NotFound,
            Self::Contended(_) => ErrorClass::StateConflict,
        }
    }

    /// Server-provided wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Scm(e) => e.retry_after(),
            _ => None,
        }
    }
}
