//! `labelflow.yaml` loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use scm::{Backend, RepoRef};
use serde::Deserialize;
use thiserror::Error;

use crate::retry::CallPolicies;
use crate::trigger::{HandlerKind, LabelPattern, LabelTrigger};

/// Default prefix for task branches.
pub const DEFAULT_BRANCH_PREFIX: &str = "labelflow";

/// Default upper bound on tasks created from one plan.
pub const DEFAULT_MAX_TASKS: usize = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("cannot resolve secret '{reference}': {reason}")]
    Secret { reference: String, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryConfig {
    pub owner: String,
    pub name: String,
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitProviderConfig {
    pub kind: Backend,
    /// API base URL for self-hosted instances
    #[serde(default)]
    pub base_url: Option<String>,
    /// Secret reference, e.g. `env:GITHUB_TOKEN`
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiConfig {
    #[serde(default = "default_ai_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Secret reference; defaults to the provider's usual env var
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_ai_provider() -> String {
    "anthropic".to_string()
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: default_ai_provider(),
            model: None,
            api_key: None,
            base_url: None,
        }
    }
}

/// One `label_triggers` entry as written in YAML.
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerConfig {
    /// Defaults to the entry's key
    #[serde(default)]
    pub label_pattern: Option<String>,
    pub handler: HandlerKind,
    #[serde(default = "default_true")]
    pub ai_enabled: bool,
    #[serde(default)]
    pub remove_on_complete: bool,
    #[serde(default)]
    pub success_label: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationConfig {
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    #[serde(default = "default_task_label")]
    pub task_label: String,
    #[serde(default = "default_ready_label")]
    pub ready_label: String,
    #[serde(default = "default_review_label")]
    pub review_label: String,
    #[serde(default = "default_proposal_label")]
    pub proposal_label: String,
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
    /// Ordered: the first matching entry wins
    #[serde(default, rename = "label_triggers")]
    pub label_triggers: serde_yaml::Mapping,
}

fn default_branch_prefix() -> String {
    DEFAULT_BRANCH_PREFIX.to_string()
}

fn default_task_label() -> String {
    "task".to_string()
}

fn default_ready_label() -> String {
    "ready".to_string()
}

fn default_review_label() -> String {
    "review".to_string()
}

fn default_proposal_label() -> String {
    "proposal".to_string()
}

fn default_max_tasks() -> usize {
    DEFAULT_MAX_TASKS
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            branch_prefix: default_branch_prefix(),
            task_label: default_task_label(),
            ready_label: default_ready_label(),
            review_label: default_review_label(),
            proposal_label: default_proposal_label(),
            max_tasks: DEFAULT_MAX_TASKS,
            label_triggers: serde_yaml::Mapping::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".labelflow/state")
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize {
    4
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutConfig {
    #[serde(default = "default_git_secs")]
    pub git_secs: u64,
    #[serde(default = "default_agent_secs")]
    pub agent_secs: u64,
}

fn default_git_secs() -> u64 {
    30
}

fn default_agent_secs() -> u64 {
    300
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            git_secs: default_git_secs(),
            agent_secs: default_agent_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_interval_secs() -> u64 {
    60
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

/// Everything the engine reads from `labelflow.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct LabelflowConfig {
    pub repository: RepositoryConfig,
    pub provider: GitProviderConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub automation: AutomationConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// Repository-level settings the handlers need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutomationSettings {
    pub repository: RepoRef,
    pub default_branch: String,
    pub branch_prefix: String,
    pub task_label: String,
    pub ready_label: String,
    pub review_label: String,
    pub proposal_label: String,
    pub max_tasks: usize,
    /// Label a human adds to approve a proposal, for hints in comments
    pub approval_label: Option<String>,
    /// Label a human adds to execute a task, for hints in comments
    pub execute_label: Option<String>,
}

impl AutomationSettings {
    /// Settings with default labels for `repository`.
    pub fn for_repository(repository: RepoRef, default_branch: impl Into<String>) -> Self {
        let automation = AutomationConfig::default();
        Self {
            repository,
            default_branch: default_branch.into(),
            branch_prefix: automation.branch_prefix,
            task_label: automation.task_label,
            ready_label: automation.ready_label,
            review_label: automation.review_label,
            proposal_label: automation.proposal_label,
            max_tasks: automation.max_tasks,
            approval_label: Some("approved".to_string()),
            execute_label: Some("execute".to_string()),
        }
    }

    /// `<prefix>/task-<id>`
    pub fn task_branch(&self, task: &scm::IssueId) -> String {
        format!("{}/task-{}", self.branch_prefix, task)
    }
}

/// Triggers used when the file declares none.
pub fn default_triggers() -> Vec<LabelTrigger> {
    let exact = |label: &str, handler, success: Option<&str>, remove| LabelTrigger {
        name: label.to_string(),
        pattern: LabelPattern::Exact(label.to_string()),
        handler,
        ai_enabled: true,
        remove_on_complete: remove,
        success_label: success.map(str::to_string),
    };

    vec![
        exact(
            "needs-planning",
            HandlerKind::Proposal,
            Some("plan-ready"),
            true,
        ),
        exact("approved", HandlerKind::Approval, Some("tasks-created"), false),
        exact("execute", HandlerKind::TaskExecution, None, true),
    ]
}

impl LabelflowConfig {
    /// Read, parse and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("repository.owner", &self.repository.owner),
            ("repository.name", &self.repository.name),
            ("repository.defaultBranch", &self.repository.default_branch),
            ("provider.token", &self.provider.token),
            ("automation.branchPrefix", &self.automation.branch_prefix),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{field} must not be empty")));
            }
        }

        if self.concurrency.workers == 0 {
            return Err(ConfigError::Invalid(
                "concurrency.workers must be at least 1".to_string(),
            ));
        }
        if self.timeouts.git_secs == 0 || self.timeouts.agent_secs == 0 {
            return Err(ConfigError::Invalid(
                "timeouts must be at least one second".to_string(),
            ));
        }
        if self.daemon.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "daemon.intervalSecs must be at least 1".to_string(),
            ));
        }
        if self.automation.max_tasks == 0 {
            return Err(ConfigError::Invalid(
                "automation.maxTasks must be at least 1".to_string(),
            ));
        }

        self.triggers().map(|_| ())
    }

    /// Triggers in declaration order; defaults when none are declared.
    pub fn triggers(&self) -> Result<Vec<LabelTrigger>, ConfigError> {
        if self.automation.label_triggers.is_empty() {
            return Ok(default_triggers());
        }

        let mut triggers = Vec::with_capacity(self.automation.label_triggers.len());
        for (key, value) in &self.automation.label_triggers {
            let name = key.as_str().ok_or_else(|| {
                ConfigError::Invalid(format!("label_triggers key {key:?} is not a string"))
            })?;
            let entry: TriggerConfig = serde_yaml::from_value(value.clone()).map_err(|e| {
                ConfigError::Invalid(format!("label_triggers.{name}: {e}"))
            })?;

            let source = entry.label_pattern.as_deref().unwrap_or(name);
            if source.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "label_triggers.{name}: label_pattern must not be empty"
                )));
            }
            let pattern = LabelPattern::compile(source).map_err(|e| {
                ConfigError::Invalid(format!("label_triggers.{name}: bad pattern: {e}"))
            })?;

            triggers.push(LabelTrigger {
                name: name.to_string(),
                pattern,
                handler: entry.handler,
                ai_enabled: entry.ai_enabled,
                remove_on_complete: entry.remove_on_complete,
                success_label: entry.success_label.filter(|l| !l.trim().is_empty()),
            });
        }
        Ok(triggers)
    }

    pub fn repo(&self) -> RepoRef {
        RepoRef::new(&self.repository.owner, &self.repository.name)
    }

    pub fn automation_settings(&self) -> Result<AutomationSettings, ConfigError> {
        let triggers = self.triggers()?;
        let label_for = |kind| {
            triggers
                .iter()
                .filter(|t: &&LabelTrigger| t.handler == kind)
                .find_map(|t| t.exact_label().map(str::to_string))
        };

        Ok(AutomationSettings {
            repository: self.repo(),
            default_branch: self.repository.default_branch.clone(),
            branch_prefix: self.automation.branch_prefix.trim_end_matches('/').to_string(),
            task_label: self.automation.task_label.clone(),
            ready_label: self.automation.ready_label.clone(),
            review_label: self.automation.review_label.clone(),
            proposal_label: self.automation.proposal_label.clone(),
            max_tasks: self.automation.max_tasks,
            approval_label: label_for(HandlerKind::Approval),
            execute_label: label_for(HandlerKind::TaskExecution),
        })
    }

    pub fn call_policies(&self) -> CallPolicies {
        CallPolicies {
            git_timeout: Duration::from_secs(self.timeouts.git_secs),
            agent_timeout: Duration::from_secs(self.timeouts.agent_secs),
            ..CallPolicies::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.daemon.interval_secs)
    }
}
