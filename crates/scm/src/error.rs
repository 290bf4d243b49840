//! Error types for SCM providers.

use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type ScmResult<T> = Result<T, ScmError>;

/// Errors that can occur when talking to a git host.
#[derive(Debug, Error)]
pub enum ScmError {
    /// Issue, branch, file or change request does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Resource already exists (branch, open change request)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Credentials lack the required scope
    #[error("permission denied ({status}): {message}")]
    Permission { status: u16, message: String },

    /// Rate limited by the service
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Timeout, connection failure or 5xx
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Response could not be decoded
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Request was rejected as malformed (4xx other than the above)
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl ScmError {
    /// Whether repeating the same call can succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Transient(_) | Self::InvalidResponse(_)
        )
    }

    /// Server-provided wait hint, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(Duration::from_secs(*retry_after_secs)),
            _ => None,
        }
    }

    /// Map a transport-level failure.
    pub(crate) fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            // Timeouts, refused/reset connections and body read failures can all
            // succeed on a later attempt.
            Self::Transient(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ScmError::Transient("502".into()).is_transient());
        assert!(ScmError::RateLimited {
            retry_after_secs: 3
        }
        .is_transient());
        assert!(!ScmError::NotFound("issue 1".into()).is_transient());
        assert!(!ScmError::Permission {
            status: 403,
            message: "no".into()
        }
        .is_transient());
        assert!(!ScmError::Conflict("branch".into()).is_transient());
    }

    #[test]
    fn test_retry_after_hint() {
        let err = ScmError::RateLimited {
            retry_after_secs: 12,
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));
        assert_eq!(ScmError::Transient("x".into()).retry_after(), None);
    }
}
