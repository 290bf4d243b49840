//! Shared REST plumbing for the provider implementations.

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{ScmError, ScmResult};

/// Fallback wait when a rate-limited response carries no hint.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Thin JSON client bound to one API root.
#[derive(Debug, Clone)]
pub(crate) struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    /// Build a client with default headers (auth, accept, user agent).
    pub(crate) fn new(base_url: &str, headers: HeaderMap, timeout: Duration) -> ScmResult<Self> {
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| ScmError::Transient(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET and decode.
    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> ScmResult<T> {
        let builder = self.client.get(self.url(path)).query(query);
        let response = self.execute(builder, path).await?;
        decode(response, path).await
    }

    /// Send a JSON body and decode the JSON reply.
    pub(crate) async fn send_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> ScmResult<T> {
        let builder = self.client.request(method, self.url(path)).json(body);
        let response = self.execute(builder, path).await?;
        decode(response, path).await
    }

    /// Send a request whose reply body is irrelevant.
    pub(crate) async fn send_empty<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> ScmResult<()> {
        let mut builder = self.client.request(method, self.url(path));
        if let Some(body) = body {
            builder = builder.json(body);
        }
        self.execute(builder, path).await.map(|_| ())
    }

    /// Send with query parameters and no body (GitLab branch creation).
    pub(crate) async fn send_query<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
    ) -> ScmResult<T> {
        let builder = self.client.request(method, self.url(path)).query(query);
        let response = self.execute(builder, path).await?;
        decode(response, path).await
    }

    async fn execute(&self, builder: RequestBuilder, what: &str) -> ScmResult<Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| ScmError::from_reqwest(&e))?;

        let status = response.status();
        if status.is_success() {
            debug!(status = status.as_u16(), path = %what, "SCM request succeeded");
            return Ok(response);
        }

        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        let err = map_status(status, &headers, &body, what);
        warn!(status = status.as_u16(), path = %what, error = %err, "SCM request failed");
        Err(err)
    }
}

async fn decode<T: DeserializeOwned>(response: Response, what: &str) -> ScmResult<T> {
    let text = response
        .text()
        .await
        .map_err(|e| ScmError::from_reqwest(&e))?;
    serde_json::from_str(&text)
        .map_err(|e| ScmError::InvalidResponse(format!("{what}: {e}")))
}

/// Classify a non-success HTTP status.
pub(crate) fn map_status(status: StatusCode, headers: &HeaderMap, body: &str, what: &str) -> ScmError {
    let message = error_message(body);

    match status.as_u16() {
        404 => ScmError::NotFound(what.to_string()),
        409 => ScmError::Conflict(message),
        429 => ScmError::RateLimited {
            retry_after_secs: retry_after(headers),
        },
        403 if is_rate_limit(headers, &message) => ScmError::RateLimited {
            retry_after_secs: retry_after(headers),
        },
        401 | 403 => ScmError::Permission {
            status: status.as_u16(),
            message,
        },
        400 | 422 if message.to_lowercase().contains("already exist") => {
            ScmError::Conflict(message)
        }
        408 => ScmError::Transient(format!("request timeout: {message}")),
        code if status.is_server_error() => ScmError::Transient(format!("{code}: {message}")),
        code => ScmError::Rejected {
            status: code,
            message,
        },
    }
}

fn is_rate_limit(headers: &HeaderMap, message: &str) -> bool {
    let exhausted = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "0");
    exhausted || message.to_lowercase().contains("rate limit")
}

fn retry_after(headers: &HeaderMap) -> u64 {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

/// Pull the human message out of the usual `{"message": ...}` envelopes.
fn error_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.trim().to_string();
    };

    let mut parts = Vec::new();
    for key in ["message", "error", "errors"] {
        match value.get(key) {
            Some(serde_json::Value::String(s)) => parts.push(s.clone()),
            Some(serde_json::Value::Array(items)) => {
                for item in items {
                    if let Some(s) = item.as_str() {
                        parts.push(s.to_string());
                    } else if let Some(s) = item.get("message").and_then(|m| m.as_str()) {
                        parts.push(s.to_string());
                    }
                }
            }
            Some(other) if !other.is_null() => parts.push(other.to_string()),
            _ => {}
        }
    }

    if parts.is_empty() {
        body.trim().to_string()
    } else {
        parts.join("; ")
    }
}
