//! `needs-planning`: draft a plan and open it as a proposal issue.

use ai::{PlanContext, PlanDocument};
use async_trait::async_trait;
use scm::NewIssue;
use tracing::info;

use super::{Artifact, Handler, HandlerContext, HandlerOutcome};
use crate::error::WorkflowResult;
use crate::record::{Stage, WorkflowRecord};
use crate::trigger::HandlerKind;

#[derive(Debug, Clone, Copy, Default)]
pub struct ProposalHandler;

/// Plan drafted from the issue itself when AI is off.
fn plan_from_issue(title: &str, body: &str) -> PlanDocument {
    let plan = if body.trim().is_empty() {
        format!("- [ ] {title}")
    } else {
        body.to_string()
    };
    PlanDocument {
        summary: title.to_string(),
        plan,
        tasks: Vec::new(),
    }
}

fn proposal_body(root_ref: &str, plan: &PlanDocument, approval_label: Option<&str>) -> String {
    let mut body = format!("Proposal for {root_ref}.\n\n## Plan\n\n{}\n", plan.plan.trim());

    if !plan.tasks.is_empty() {
        body.push_str("\n## Tasks\n\n");
        for task in &plan.tasks {
            body.push_str(&format!("- [ ] {}\n", task.title.trim()));
        }
    }

    if let Some(label) = approval_label {
        body.push_str(&format!(
            "\n---\nAdd the `{label}` label to this issue to create the tasks.\n"
        ));
    }
    body
}

#[async_trait]
impl Handler for ProposalHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Proposal
    }

    async fn run(
        &self,
        ctx: HandlerContext<'_>,
        record: &mut WorkflowRecord,
        outcome: &mut HandlerOutcome,
    ) -> WorkflowResult<()> {
        let services = ctx.services;
        let root = &ctx.issue.id;
        let root_ref = services.issue_ref(root);

        let proposal = match record.proposal_issue.clone() {
            Some(existing) if record.stage >= Stage::PlanProposed => {
                outcome.skip(format!(
                    "proposal {} already exists",
                    services.issue_ref(&existing)
                ));
                existing
            }
            _ => {
                let plan = match services.agent_for(ctx.trigger)? {
                    Some(agent) => {
                        let context = PlanContext {
                            issue_ref: root_ref.clone(),
                            title: ctx.issue.title.clone(),
                            body: ctx.issue.body.clone(),
                        };
                        let context = &context;
                        services
                            .call_agent("propose_plan", move || agent.propose_plan(context))
                            .await?
                    }
                    None => plan_from_issue(&ctx.issue.title, &ctx.issue.body),
                };

                let new_issue = NewIssue {
                    title: format!("[PROPOSAL] {} ({root_ref})", plan.summary.trim()),
                    body: proposal_body(
                        &root_ref,
                        &plan,
                        services.settings.approval_label.as_deref(),
                    ),
                    labels: vec![services.settings.proposal_label.clone()],
                };
                let git = services.git.as_ref();
                let new_issue = &new_issue;
                let id = services
                    .call_git("create_issue", move || git.create_issue(new_issue))
                    .await?;

                info!(root = %root, proposal = %id, "Created proposal issue");
                record.proposal_issue = Some(id.clone());
                record.proposal_announced = false;
                record.advance(Stage::PlanProposed);
                outcome.artifact(Artifact::ProposalIssue(id.clone()));
                services.checkpoint(record).await?;
                id
            }
        };

        if !record.proposal_announced {
            let comment = format!(
                "📝 Drafted a proposal in {}. Review it there.",
                services.issue_ref(&proposal)
            );
            let comment_id = services.comment(root, &comment).await?;
            record.proposal_announced = true;
            outcome.artifact(Artifact::Comment(comment_id));
            outcome.comment = Some(comment);
        }

        outcome.complete_trigger(&ctx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ai::TaskSpec;

    #[test]
    fn test_plan_from_issue() {
        let plan = plan_from_issue("Export CSV", "");
        assert_eq!(plan.summary, "Export CSV");
        assert_eq!(plan.plan, "- [ ] Export CSV");

        let plan = plan_from_issue("Export CSV", "- [ ] a\n- [ ] b");
        assert_eq!(plan.plan, "- [ ] a\n- [ ] b");
    }

    #[test]
    fn test_proposal_body_lists_tasks() {
        let plan = PlanDocument {
            summary: "Export".into(),
            plan: "Add an exporter.".into(),
            tasks: vec![
                TaskSpec {
                    title: "Writer".into(),
                    description: String::new(),
                },
                TaskSpec {
                    title: "CLI flag".into(),
                    description: String::new(),
                },
            ],
        };
        let body = proposal_body("#42", &plan, Some("approved"));

        assert!(body.starts_with("Proposal for #42."));
        assert!(body.contains("- [ ] Writer\n- [ ] CLI flag\n"));
        assert!(body.contains("`approved`"));
    }
}
