//! Error types for agent providers.

use thiserror::Error;

/// Result type alias for agent operations.
pub type AiResult<T> = Result<T, AiError>;

/// Errors that can occur when generating content.
#[derive(Debug, Error)]
pub enum AiError {
    /// Provider has no API key
    #[error("{provider} is not configured: {env_var} not set")]
    NotConfigured {
        provider: &'static str,
        env_var: &'static str,
    },

    /// No provider registered under this name
    #[error("unknown AI provider '{0}'")]
    UnknownProvider(String),

    /// Request never got a response (connect failure, timeout)
    #[error("{provider} request failed: {message}")]
    Transport {
        provider: &'static str,
        message: String,
        timed_out: bool,
    },

    /// Provider answered with an error status
    #[error("{provider} API error ({status}): {message}")]
    Api {
        provider: &'static str,
        status: u16,
        message: String,
    },

    /// Model output did not match the expected structure
    #[error("failed to parse AI response: {reason}")]
    Parse { reason: String },

    /// Prompt template failed to render
    #[error("prompt '{name}' failed to render: {reason}")]
    Prompt { name: String, reason: String },
}

impl AiError {
    /// Whether repeating the same request can succeed.
    ///
    /// Timeouts, connection failures, 429 and 5xx are transient; everything
    /// else (bad key, malformed output, refused prompt) fails the same way again.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Whether the request ran into a client-side timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport { timed_out: true, .. })
    }

    pub(crate) fn transport(provider: &'static str, err: &reqwest::Error) -> Self {
        Self::Transport {
            provider,
            message: err.to_string(),
            timed_out: err.is_timeout(),
        }
    }
}
