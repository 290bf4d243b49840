//! `approved`: break the plan into task issues.

use std::sync::LazyLock;

use ai::{BreakdownContext, TaskSpec};
use async_trait::async_trait;
use regex::Regex;
use scm::NewIssue;
use tracing::info;

use super::{Artifact, Handler, HandlerContext, HandlerOutcome};
use crate::error::WorkflowResult;
use crate::record::{Stage, WorkflowRecord};
use crate::trigger::HandlerKind;

/// Markdown task list item: `- [ ] title` (also `*`, checked boxes).
static CHECKLIST_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*[-*+]\s+\[[ xX]?\]\s+(.+?)\s*$").expect("checklist pattern is valid")
});

static TITLE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[[A-Z]+[^\]]*\]\s*").expect("title prefix pattern is valid"));

#[derive(Debug, Clone, Copy, Default)]
pub struct ApprovalHandler;

/// Tasks from markdown checklist items, in document order.
pub fn parse_checklist(markdown: &str) -> Vec<TaskSpec> {
    CHECKLIST_ITEM
        .captures_iter(markdown)
        .filter_map(|caps| caps.get(1))
        .map(|m| TaskSpec {
            title: m.as_str().to_string(),
            description: String::new(),
        })
        .collect()
}

/// Title without a leading `[PROPOSAL]`-style tag and trailing reference.
fn plan_title(title: &str, root_ref: &str) -> String {
    let title = TITLE_PREFIX.replace(title, "");
    let suffix = format!("({root_ref})");
    title
        .trim()
        .strip_suffix(&suffix)
        .unwrap_or(title.trim())
        .trim()
        .to_string()
}

fn task_body(task: &TaskSpec, root_ref: &str, plan_ref: &str, execute_label: Option<&str>) -> String {
    let mut body = String::new();
    if !task.description.trim().is_empty() {
        body.push_str(task.description.trim());
        body.push_str("\n\n");
    }
    body.push_str(&format!("---\nPart of {root_ref}"));
    if plan_ref != root_ref {
        body.push_str(&format!(" (plan: {plan_ref})"));
    }
    body.push_str(".\n");
    if let Some(label) = execute_label {
        body.push_str(&format!(
            "\nAdd the `{label}` label to implement this task.\n"
        ));
    }
    body
}

#[async_trait]
impl Handler for ApprovalHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Approval
    }

    async fn run(
        &self,
        ctx: HandlerContext<'_>,
        record: &mut WorkflowRecord,
        outcome: &mut HandlerOutcome,
    ) -> WorkflowResult<()> {
        let services = ctx.services;
        let settings = &services.settings;
        let plan_issue = ctx.issue;
        let root_ref = services.issue_ref(&record.root_issue);
        let plan_ref = services.issue_ref(&plan_issue.id);

        if record.planned_tasks.is_empty() {
            let mut tasks = match services.agent_for(ctx.trigger)? {
                Some(agent) => {
                    let context = BreakdownContext {
                        root_ref: root_ref.clone(),
                        plan_title: plan_title(&plan_issue.title, &root_ref),
                        plan: plan_issue.body.clone(),
                        max_tasks: settings.max_tasks,
                    };
                    let context = &context;
                    services
                        .call_agent("break_down", move || agent.break_down(context))
                        .await?
                        .tasks
                }
                None => parse_checklist(&plan_issue.body),
            };
            if tasks.is_empty() {
                tasks.push(TaskSpec {
                    title: plan_title(&plan_issue.title, &root_ref),
                    description: plan_issue.body.clone(),
                });
            }
            tasks.truncate(settings.max_tasks);

            record.planned_tasks = tasks;
            services.checkpoint(record).await?;
        }

        let total = record.planned_tasks.len();
        let resume_at = record.task_issues.len();
        if resume_at >= total {
            outcome.skip(format!("{total} task issues already exist"));
        }

        for index in resume_at..total {
            let task = &record.planned_tasks[index];
            let new_issue = NewIssue {
                title: format!("[TASK {}/{total}] {}", index + 1, task.title.trim()),
                body: task_body(
                    task,
                    &root_ref,
                    &plan_ref,
                    settings.execute_label.as_deref(),
                ),
                labels: vec![settings.task_label.clone(), settings.ready_label.clone()],
            };

            let git = services.git.as_ref();
            let new_issue = &new_issue;
            let id = services
                .call_git("create_issue", move || git.create_issue(new_issue))
                .await?;

            info!(root = %record.root_issue, task = %id, position = index + 1, total, "Created task issue");
            record.task_issues.push(id.clone());
            outcome.artifact(Artifact::TaskIssue(id));
            services.checkpoint(record).await?;
        }

        record.advance(Stage::TasksCreated);

        if !record.tasks_announced {
            let mut comment = format!("✅ Created {total} task issue(s):\n\n");
            for (index, task) in record.task_issues.iter().enumerate() {
                comment.push_str(&format!(
                    "{}. {}\n",
                    index + 1,
                    services.issue_ref(task)
                ));
            }
            let comment_id = services.comment(&plan_issue.id, &comment).await?;
            record.tasks_announced = true;
            outcome.artifact(Artifact::Comment(comment_id));
            outcome.comment = Some(comment);
        }

        outcome.complete_trigger(&ctx);
        Ok(())
    }
}
