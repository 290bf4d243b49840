//! Bounded retry with exponential backoff for adapter and agent calls.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ErrorClass, WorkflowError, WorkflowResult};

/// Retry configuration for one class of calls.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Label mutations: cheap, and a stale label confuses humans.
    pub fn labels() -> Self {
        Self {
            max_attempts: 6,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }

    /// Every other git hosting call.
    pub fn git() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }

    /// Agent calls.
    pub fn agent() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }

    /// Delay after the `retry`-th failed attempt (0-based).
    #[allow(clippy::cast_possible_wrap)]
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let exp = i32::try_from(retry.min(10)).unwrap_or(10);
        let multiplier = self.backoff_multiplier.powi(exp);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Retry policies and deadlines for the calls a handler makes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallPolicies {
    pub labels: RetryPolicy,
    pub git: RetryPolicy,
    pub agent: RetryPolicy,
    pub git_timeout: Duration,
    pub agent_timeout: Duration,
}

impl Default for CallPolicies {
    fn default() -> Self {
        Self {
            labels: RetryPolicy::labels(),
            git: RetryPolicy::git(),
            agent: RetryPolicy::agent(),
            git_timeout: Duration::from_secs(30),
            agent_timeout: Duration::from_secs(300),
        }
    }
}

/// Run `call` until it succeeds, fails with a non-transient error, or the
/// policy is exhausted. Each attempt is bounded by `timeout`.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    timeout: Duration,
    operation: &'static str,
    mut call: F,
) -> WorkflowResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<WorkflowError>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        let err = match tokio::time::timeout(timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e.into(),
            Err(_) => WorkflowError::Timeout {
                operation,
                after: timeout,
            },
        };

        if err.class() != ErrorClass::Transient || !policy.should_retry(attempts) {
            return Err(err);
        }

        let mut delay = policy.delay_for_attempt(attempts - 1);
        if let Some(hint) = err.retry_after() {
            delay = delay.max(hint);
        }
        warn!(
            operation,
            attempt = attempts,
            error = %err,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Transient error, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
