//! Stage handlers behind one [`Handler`] contract.
//!
//! Each handler owns one step of the lifecycle. Handlers are re-entrant: a
//! redelivered or retried event finds the artifacts recorded by the previous
//! attempt and continues from there instead of creating them again.

mod approval;
mod proposal;
mod task_execution;

use std::future::Future;
use std::sync::Arc;

use ai::{Agent, AiResult};
use async_trait::async_trait;
use scm::{ChangeRequestId, CommentId, GitProvider, Issue, IssueId, ScmResult};
use serde::Serialize;
use tracing::{error, warn};

use crate::config::{AutomationSettings, ConfigError};
use crate::error::{ErrorClass, WorkflowError, WorkflowResult};
use crate::event::LabelEvent;
use crate::record::WorkflowRecord;
use crate::retry::{with_retry, CallPolicies};
use crate::store::StateStore;
use crate::trigger::{HandlerKind, LabelTrigger};

pub use approval::{parse_checklist, ApprovalHandler};
pub use proposal::ProposalHandler;
pub use task_execution::TaskExecutionHandler;

/// How a handler run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerStatus {
    Succeeded,
    Failed,
    RetryableFailed,
}

impl HandlerStatus {
    pub fn for_class(class: ErrorClass) -> Self {
        if class.is_retryable() {
            Self::RetryableFailed
        } else {
            Self::Failed
        }
    }
}

/// Remote objects a handler created or reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Artifact {
    ProposalIssue(IssueId),
    TaskIssue(IssueId),
    Branch(String),
    Commit(String),
    ChangeRequest(ChangeRequestId),
    Comment(CommentId),
}

/// A failure after classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifiedError {
    pub class: ErrorClass,
    pub message: String,
}

impl From<&WorkflowError> for ClassifiedError {
    fn from(err: &WorkflowError) -> Self {
        Self {
            class: err.class(),
            message: err.to_string(),
        }
    }
}

/// What a handler did and which labels the orchestrator should apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerOutcome {
    pub status: HandlerStatus,
    pub labels_to_add: Vec<String>,
    pub labels_to_remove: Vec<String>,
    /// Last comment the handler posted
    pub comment: Option<String>,
    pub created_artifacts: Vec<Artifact>,
    pub error: Option<ClassifiedError>,
    /// Set when the work was already done and the handler short-circuited
    pub skipped: Option<String>,
}

impl HandlerOutcome {
    pub fn succeeded() -> Self {
        Self {
            status: HandlerStatus::Succeeded,
            labels_to_add: Vec::new(),
            labels_to_remove: Vec::new(),
            comment: None,
            created_artifacts: Vec::new(),
            error: None,
            skipped: None,
        }
    }

    /// Turn this outcome into a failure, keeping recorded artifacts and
    /// dropping label transitions.
    pub fn into_failure(mut self, err: &WorkflowError) -> Self {
        let classified = ClassifiedError::from(err);
        self.status = HandlerStatus::for_class(classified.class);
        self.error = Some(classified);
        self.labels_to_add.clear();
        self.labels_to_remove.clear();
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == HandlerStatus::Succeeded
    }

    pub fn artifact(&mut self, artifact: Artifact) {
        self.created_artifacts.push(artifact);
    }

    pub fn skip(&mut self, reason: impl Into<String>) {
        self.skipped = Some(reason.into());
    }

    pub fn add_label(&mut self, label: &str) {
        if !self.labels_to_add.iter().any(|l| l == label) {
            self.labels_to_add.push(label.to_string());
        }
    }

    pub fn remove_label(&mut self, label: &str) {
        if !self.labels_to_remove.iter().any(|l| l == label) {
            self.labels_to_remove.push(label.to_string());
        }
    }

    /// Trigger-driven transitions shared by every handler: add the success
    /// label, drop the trigger label when configured to.
    pub fn complete_trigger(&mut self, ctx: &HandlerContext<'_>) {
        if let Some(label) = &ctx.trigger.success_label {
            self.add_label(label);
        }
        if ctx.trigger.remove_on_complete {
            self.remove_label(&ctx.event.label);
        }
        // Never remove what we add in the same call
        let added = self.labels_to_add.clone();
        self.labels_to_remove.retain(|l| !added.contains(l));
    }
}

/// Collaborators shared by all handlers for the lifetime of an orchestrator.
pub struct Services {
    pub git: Arc<dyn GitProvider>,
    /// `None` when no AI provider is configured
    pub agent: Option<Agent>,
    pub store: Arc<dyn StateStore>,
    pub settings: AutomationSettings,
    pub policies: CallPolicies,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("backend", &self.git.backend())
            .field("agent", &self.agent)
            .field("store", &self.store.storage_type())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Services {
    /// A git hosting call under the git retry policy.
    pub async fn call_git<T, F, Fut>(&self, operation: &'static str, call: F) -> WorkflowResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ScmResult<T>>,
    {
        with_retry(
            &self.policies.git,
            self.policies.git_timeout,
            operation,
            call,
        )
        .await
    }

    /// Apply a label transition under the (more patient) label policy.
    pub async fn set_labels(
        &self,
        issue: &IssueId,
        add: &[String],
        remove: &[String],
    ) -> WorkflowResult<()> {
        if add.is_empty() && remove.is_empty() {
            return Ok(());
        }
        let git = self.git.as_ref();
        with_retry(
            &self.policies.labels,
            self.policies.git_timeout,
            "set_labels",
            move || git.set_labels(issue, add, remove),
        )
        .await
    }

    pub async fn comment(&self, issue: &IssueId, body: &str) -> WorkflowResult<CommentId> {
        let git = self.git.as_ref();
        self.call_git("add_comment", move || git.add_comment(issue, body))
            .await
    }

    /// An agent call under the agent retry policy and deadline.
    pub async fn call_agent<T, F, Fut>(&self, operation: &'static str, call: F) -> WorkflowResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AiResult<T>>,
    {
        with_retry(
            &self.policies.agent,
            self.policies.agent_timeout,
            operation,
            call,
        )
        .await
    }

    /// The agent to use for `trigger`, or `None` when the trigger runs
    /// without AI.
    pub fn agent_for(&self, trigger: &LabelTrigger) -> WorkflowResult<Option<&Agent>> {
        if !trigger.ai_enabled {
            return Ok(None);
        }
        self.agent.as_ref().map(Some).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "trigger '{}' has ai_enabled but no AI provider is configured",
                trigger.name
            ))
            .into()
        })
    }

    /// Persist progress after an irreversible remote side effect.
    pub async fn checkpoint(&self, record: &mut WorkflowRecord) -> WorkflowResult<()> {
        self.store.save(record).await.map_err(WorkflowError::from)
    }

    /// Tell humans on `issue` that processing failed. Configuration errors
    /// stay in the logs.
    pub async fn report_failure(&self, issue: &IssueId, err: &WorkflowError) -> Option<CommentId> {
        let class = err.class();
        if class == ErrorClass::Configuration {
            return None;
        }

        let retry_hint = if class.is_retryable() {
            "This looks temporary; the next delivery of this label event will retry."
        } else {
            "Re-apply the label once the problem is fixed to try again."
        };
        let body = format!(
            "⚠️ **labelflow** could not process this issue ({class}).\n\n```\n{err}\n```\n\n{retry_hint}"
        );

        match self.comment(issue, &body).await {
            Ok(id) => Some(id),
            Err(comment_err) => {
                warn!(issue = %issue, error = %comment_err, "Failed to post failure comment");
                None
            }
        }
    }

    pub fn issue_ref(&self, id: &IssueId) -> String {
        self.git.issue_reference(id)
    }
}

/// Everything a handler run sees.
#[derive(Debug, Clone, Copy)]
pub struct HandlerContext<'a> {
    pub event: &'a LabelEvent,
    /// The triggering issue, freshly fetched
    pub issue: &'a Issue,
    pub trigger: &'a LabelTrigger,
    pub services: &'a Services,
}

#[async_trait]
pub trait Handler: Send + Sync {
    fn kind(&self) -> HandlerKind;

    /// Do the work, recording artifacts on `record` and `outcome` as they
    /// are created.
    async fn run(
        &self,
        ctx: HandlerContext<'_>,
        record: &mut WorkflowRecord,
        outcome: &mut HandlerOutcome,
    ) -> WorkflowResult<()>;

    /// Run and classify. Failures are commented on the triggering issue.
    async fn handle(&self, ctx: HandlerContext<'_>, record: &mut WorkflowRecord) -> HandlerOutcome {
        let mut outcome = HandlerOutcome::succeeded();
        match self.run(ctx, record, &mut outcome).await {
            Ok(()) => outcome,
            Err(err) => {
                error!(
                    handler = %self.kind(),
                    issue = %ctx.issue.id,
                    class = %err.class(),
                    error = %err,
                    "Handler failed"
                );
                if let Some(id) = ctx.services.report_failure(&ctx.issue.id, &err).await {
                    outcome.artifact(Artifact::Comment(id));
                }
                outcome.into_failure(&err)
            }
        }
    }
}

static PROPOSAL: ProposalHandler = ProposalHandler;
static APPROVAL: ApprovalHandler = ApprovalHandler;
static TASK_EXECUTION: TaskExecutionHandler = TaskExecutionHandler;

/// The handler for a trigger kind.
pub fn handler_for(kind: HandlerKind) -> &'static dyn Handler {
    match kind {
        HandlerKind::Proposal => &PROPOSAL,
        HandlerKind::Approval => &APPROVAL,
        HandlerKind::TaskExecution => &TASK_EXECUTION,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scm::ScmError;

    #[test]
    fn test_status_for_class() {
        assert_eq!(
            HandlerStatus::for_class(ErrorClass::Transient),
            HandlerStatus::RetryableFailed
        );
        assert_eq!(
            HandlerStatus::for_class(ErrorClass::StateConflict),
            HandlerStatus::RetryableFailed
        );
        assert_eq!(
            HandlerStatus::for_class(ErrorClass::AgentGeneration),
            HandlerStatus::Failed
        );
    }

    #[test]
    fn test_failure_drops_label_transitions() {
        let mut outcome = HandlerOutcome::succeeded();
        outcome.add_label("plan-ready");
        outcome.artifact(Artifact::Branch("labelflow/task-1".into()));

        let failed = outcome.into_failure(&WorkflowError::from(ScmError::Permission {
            status: 403,
            message: "no push".into(),
        }));
        assert_eq!(failed.status, HandlerStatus::Failed);
        assert!(failed.labels_to_add.is_empty());
        assert_eq!(failed.created_artifacts.len(), 1);
        assert_eq!(failed.error.unwrap().class, ErrorClass::Permission);
    }

    #[test]
    fn test_handler_for_kind() {
        for kind in [
            HandlerKind::Proposal,
            HandlerKind::Approval,
            HandlerKind::TaskExecution,
        ] {
            assert_eq!(handler_for(kind).kind(), kind);
        }
    }
}
