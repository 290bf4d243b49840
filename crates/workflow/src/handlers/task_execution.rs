//! `execute`: implement one task on a branch and open a change request.

use ai::ChangeContext;
use async_trait::async_trait;
use scm::{ChangeRequestFilter, FileChange, Issue, NewChangeRequest, ScmError};
use tracing::{debug, info};

use super::{Artifact, Handler, HandlerContext, HandlerOutcome};
use crate::error::{WorkflowError, WorkflowResult};
use crate::record::{Stage, WorkflowRecord};
use crate::trigger::HandlerKind;

/// Directory for task briefs committed when AI is off.
pub const BRIEF_DIR: &str = ".labelflow/tasks";

#[derive(Debug, Clone, Copy, Default)]
pub struct TaskExecutionHandler;

/// Brief committed in place of generated code, so the change request has a
/// diff for a human to build on.
fn task_brief(issue: &Issue, issue_ref: &str) -> FileChange {
    let mut content = format!("# {}\n\nTracking issue: {issue_ref}\n", issue.title.trim());
    if !issue.body.trim().is_empty() {
        content.push('\n');
        content.push_str(issue.body.trim());
        content.push('\n');
    }
    FileChange {
        path: format!("{BRIEF_DIR}/task-{}.md", issue.id),
        content,
    }
}

#[async_trait]
impl Handler for TaskExecutionHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::TaskExecution
    }

    async fn run(
        &self,
        ctx: HandlerContext<'_>,
        record: &mut WorkflowRecord,
        outcome: &mut HandlerOutcome,
    ) -> WorkflowResult<()> {
        let services = ctx.services;
        let settings = &services.settings;
        let git = services.git.as_ref();
        let task = ctx.issue;
        let task_ref = services.issue_ref(&task.id);

        let slot = record.ensure_task_run(&task.id);
        let branch = record.task_runs[slot]
            .branch
            .clone()
            .unwrap_or_else(|| settings.task_branch(&task.id));
        record.advance(Stage::Executing);

        if record.task_runs[slot].change_request.is_some() && record.task_runs[slot].announced {
            outcome.skip(format!("{task_ref} already has a change request"));
        }

        if record.task_runs[slot].branch.is_none() {
            let (from, name) = (settings.default_branch.as_str(), branch.as_str());
            match services
                .call_git("create_branch", move || git.create_branch(from, name))
                .await
            {
                Ok(()) => info!(task = %task.id, branch = %branch, "Created branch"),
                Err(WorkflowError::Scm(ScmError::Conflict(_))) => {
                    debug!(branch = %branch, "Branch already exists, reusing");
                }
                Err(e) => return Err(e),
            }
            record.task_runs[slot].branch = Some(branch.clone());
            record.feature_branch = Some(branch.clone());
            outcome.artifact(Artifact::Branch(branch.clone()));
            services.checkpoint(record).await?;
        }

        if !record.task_runs[slot].committed {
            let (message, files) = match services.agent_for(ctx.trigger)? {
                Some(agent) => {
                    let context = ChangeContext {
                        task_ref: task_ref.clone(),
                        task_title: task.title.clone(),
                        task_body: task.body.clone(),
                        branch: branch.clone(),
                    };
                    let context = &context;
                    let change = services
                        .call_agent("generate_change", move || agent.generate_change(context))
                        .await?;
                    let message = change
                        .commit_message
                        .filter(|m| !m.trim().is_empty())
                        .unwrap_or_else(|| format!("{} ({task_ref})", change.summary.trim()));
                    let files = change
                        .files
                        .into_iter()
                        .map(|f| FileChange {
                            path: f.path,
                            content: f.content,
                        })
                        .collect::<Vec<_>>();
                    (message, files)
                }
                None => (
                    format!("Add task brief for {task_ref}"),
                    vec![task_brief(task, &task_ref)],
                ),
            };

            let (name, message, files) = (branch.as_str(), message.as_str(), files.as_slice());
            services
                .call_git("commit_changes", move || {
                    git.commit_changes(name, message, files)
                })
                .await?;

            info!(task = %task.id, branch = %branch, files = files.len(), "Committed change");
            record.task_runs[slot].committed = true;
            outcome.artifact(Artifact::Commit(branch.clone()));
            services.checkpoint(record).await?;
        }

        if record.task_runs[slot].change_request.is_none() {
            let filter = ChangeRequestFilter::open_from(branch.clone());
            let filter = &filter;
            let existing = services
                .call_git("list_change_requests", move || {
                    git.list_change_requests(filter)
                })
                .await?
                .into_iter()
                .find(|cr| cr.target_branch == settings.default_branch);

            let (id, url) = match existing {
                Some(cr) => {
                    debug!(change_request = %cr.id, "Reusing open change request");
                    (cr.id, cr.url)
                }
                None => {
                    let request = NewChangeRequest {
                        source_branch: branch.clone(),
                        target_branch: settings.default_branch.clone(),
                        title: task.title.clone(),
                        body: format!(
                            "Closes {task_ref}.\n\nOpened by labelflow from `{branch}`."
                        ),
                    };
                    let request = &request;
                    let id = services
                        .call_git("open_change_request", move || {
                            git.open_change_request(request)
                        })
                        .await?;
                    info!(task = %task.id, change_request = %id, "Opened change request");
                    (id, None)
                }
            };

            let run = &mut record.task_runs[slot];
            run.change_request = Some(id.clone());
            run.change_request_url = url;
            record.merge_request = Some(id.clone());
            record.feature_branch = Some(branch.clone());
            outcome.artifact(Artifact::ChangeRequest(id));
            services.checkpoint(record).await?;
        }

        if !record.task_runs[slot].announced {
            let run = &record.task_runs[slot];
            let cr_ref = run
                .change_request
                .as_ref()
                .map(|id| git.change_request_reference(id))
                .unwrap_or_default();
            let link = run
                .change_request_url
                .as_ref()
                .map(|url| format!(" ({url})"))
                .unwrap_or_default();
            let comment = format!(
                "🚀 Opened {} {cr_ref}{link} from `{branch}` targeting `{}`.",
                git.backend().change_request_noun(),
                settings.default_branch
            );

            let comment_id = services.comment(&task.id, &comment).await?;
            record.task_runs[slot].announced = true;
            outcome.artifact(Artifact::Comment(comment_id));
            outcome.comment = Some(comment);
        }

        record.advance(Stage::InReview);

        outcome.add_label(&settings.review_label);
        outcome.remove_label(&settings.ready_label);
        outcome.complete_trigger(&ctx);
        Ok(())
    }
}
