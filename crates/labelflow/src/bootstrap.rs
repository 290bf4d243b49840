//! Wire configuration into a ready orchestrator.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ai::{build_provider, env_var_for, Agent, ProviderConfig};
use scm::ProviderSettings;
use tracing::{debug, info, warn};
use workflow::{
    ConfigError, FileStore, LabelflowConfig, Services, StateStore, WorkflowOrchestrator,
};

use crate::secrets;

pub fn load_config(path: &Path) -> Result<LabelflowConfig, ConfigError> {
    let config = LabelflowConfig::load(path)?;
    debug!(
        path = %path.display(),
        repository = %config.repo(),
        backend = %config.provider.kind,
        "Loaded configuration"
    );
    Ok(config)
}

/// The record store under `state.dir`.
pub fn open_store(config: &LabelflowConfig) -> Arc<dyn StateStore> {
    Arc::new(FileStore::new(&config.state.dir))
}

/// Build the agent, or `None` when no API key is available and no trigger
/// needs one.
fn build_agent(config: &LabelflowConfig) -> Result<Option<Agent>, ConfigError> {
    let needs_ai = config.triggers()?.iter().any(|t| t.ai_enabled);
    let provider_name = config.ai.provider.as_str();

    let api_key = match config.ai.api_key.as_deref() {
        Some(reference) => Some(secrets::resolve(reference)?),
        None => std::env::var(env_var_for(provider_name))
            .ok()
            .filter(|key| !key.trim().is_empty()),
    };

    let Some(api_key) = api_key else {
        if needs_ai {
            return Err(ConfigError::Invalid(format!(
                "AI is enabled for a trigger but no API key is set (ai.apiKey or {})",
                env_var_for(provider_name)
            )));
        }
        warn!("No AI provider configured; triggers run without AI");
        return Ok(None);
    };

    let provider_config = ProviderConfig {
        api_key: Some(api_key),
        base_url: config.ai.base_url.clone(),
        timeout: Duration::from_secs(config.timeouts.agent_secs),
    };
    let provider = build_provider(provider_name, &provider_config)
        .map_err(|e| ConfigError::Invalid(format!("ai.provider: {e}")))?;

    Ok(Some(Agent::new(provider, config.ai.model.clone())))
}

/// Connect the git host and the agent and assemble the orchestrator.
pub fn orchestrator(
    config: &LabelflowConfig,
    store: Arc<dyn StateStore>,
) -> Result<WorkflowOrchestrator, ConfigError> {
    let settings = ProviderSettings {
        backend: config.provider.kind,
        repo: config.repo(),
        token: secrets::resolve(&config.provider.token)?,
        base_url: config.provider.base_url.clone(),
        timeout: Duration::from_secs(config.timeouts.git_secs),
    };
    let git = scm::connect(&settings)
        .map_err(|e| ConfigError::Invalid(format!("provider: {e}")))?;

    let agent = build_agent(config)?;
    let services = Services {
        git,
        agent,
        store,
        settings: config.automation_settings()?,
        policies: config.call_policies(),
    };

    info!(
        repository = %config.repo(),
        backend = %config.provider.kind,
        ai = services.agent.is_some(),
        workers = config.concurrency.workers,
        "Orchestrator ready"
    );
    Ok(WorkflowOrchestrator::new(services, config.triggers()?).with_workers(config.concurrency.workers))
}
