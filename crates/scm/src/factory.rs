//! Provider construction from settings.

use std::sync::Arc;
use std::time::Duration;

use crate::error::ScmResult;
use crate::gitea::GiteaProvider;
use crate::github::GitHubProvider;
use crate::gitlab::GitLabProvider;
use crate::provider::GitProvider;
use crate::types::{Backend, RepoRef};

/// Everything needed to talk to one repository.
#[derive(Clone)]
pub struct ProviderSettings {
    pub backend: Backend,
    pub repo: RepoRef,
    pub token: String,
    /// API root override; each backend has a public default.
    pub base_url: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl std::fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("backend", &self.backend)
            .field("repo", &self.repo)
            .field("token", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Build the provider for `settings.backend`.
pub fn connect(settings: &ProviderSettings) -> ScmResult<Arc<dyn GitProvider>> {
    let base_url = settings.base_url.as_deref();
    let repo = settings.repo.clone();
    let token = settings.token.as_str();

    let provider: Arc<dyn GitProvider> = match settings.backend {
        Backend::GitHub => Arc::new(GitHubProvider::new(repo, token, base_url, settings.timeout)?),
        Backend::GitLab => Arc::new(GitLabProvider::new(repo, token, base_url, settings.timeout)?),
        Backend::Gitea => Arc::new(GiteaProvider::new(repo, token, base_url, settings.timeout)?),
    };

    tracing::debug!(
        backend = %settings.backend,
        repo = %settings.repo,
        "Connected SCM provider"
    );
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_selects_backend() {
        for backend in [Backend::GitHub, Backend::GitLab, Backend::Gitea] {
            let provider = connect(&ProviderSettings {
                backend,
                repo: RepoRef::new("acme", "widgets"),
                token: "t0ken".to_string(),
                base_url: Some("http://localhost:1".to_string()),
                timeout: Duration::from_secs(5),
            })
            .unwrap();
            assert_eq!(provider.backend(), backend);
        }
    }

    #[test]
    fn test_debug_redacts_token() {
        let settings = ProviderSettings {
            backend: Backend::GitHub,
            repo: RepoRef::new("acme", "widgets"),
            token: "supersecret".to_string(),
            base_url: None,
            timeout: Duration::from_secs(5),
        };
        assert!(!format!("{settings:?}").contains("supersecret"));
    }
}
