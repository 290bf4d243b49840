//! Text and JSON rendering of command results.

use colored::Colorize;
use serde::Serialize;
use workflow::{
    BatchReport, Disposition, EventReport, HandlerStatus, PollSummary, Stage, WorkflowRecord,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn stage_colored(stage: Stage) -> colored::ColoredString {
    let label = stage.as_str();
    match stage {
        Stage::Done => label.green().bold(),
        Stage::Failed => label.red().bold(),
        Stage::InReview => label.cyan(),
        Stage::New => label.dimmed(),
        Stage::PlanProposed | Stage::TasksCreated | Stage::Executing => label.yellow(),
    }
}

fn report_line(report: &EventReport) -> String {
    let event = report.event.to_string();
    match (report.disposition, &report.outcome) {
        (Disposition::Processed, Some(outcome)) => match outcome.status {
            HandlerStatus::Succeeded => {
                let detail = outcome
                    .skipped
                    .as_deref()
                    .map_or_else(String::new, |reason| format!(" ({reason})"));
                format!("{} {event}{}", "✓".green(), detail.dimmed())
            }
            HandlerStatus::RetryableFailed | HandlerStatus::Failed => {
                let error = outcome
                    .error
                    .as_ref()
                    .map_or_else(String::new, |e| format!(": [{}] {}", e.class, e.message));
                let mark = if outcome.status == HandlerStatus::Failed {
                    "✗".red()
                } else {
                    "↻".yellow()
                };
                format!("{mark} {event}{}", error.red())
            }
        },
        (Disposition::Duplicate, _) => format!("{} {event} {}", "=".dimmed(), "(duplicate)".dimmed()),
        (Disposition::NoMatch, _) => format!("{} {event} {}", "-".dimmed(), "(no trigger)".dimmed()),
        (Disposition::Unlabeled, _) | (Disposition::Processed, None) => {
            format!("{} {event}", "-".dimmed())
        }
    }
}

pub fn event_report(report: &EventReport, format: OutputFormat) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        return print_json(report);
    }

    println!("{}", report_line(report));
    if let (Some(root), Some(stage)) = (&report.root_issue, report.stage) {
        println!("  root #{root} is {}", stage_colored(stage));
    }
    if let Some(outcome) = &report.outcome {
        for artifact in &outcome.created_artifacts {
            println!("  {} {}", "+".green(), serde_json::to_string(artifact)?.dimmed());
        }
        if !outcome.labels_to_add.is_empty() || !outcome.labels_to_remove.is_empty() {
            println!(
                "  labels +[{}] -[{}]",
                outcome.labels_to_add.join(", "),
                outcome.labels_to_remove.join(", ")
            );
        }
    }
    Ok(())
}

pub fn batch_report(
    batch: &BatchReport,
    completed: &[scm::IssueId],
    format: OutputFormat,
) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        return print_json(&serde_json::json!({
            "batch": batch,
            "completed": completed,
        }));
    }

    if batch.reports.is_empty() && batch.errors.is_empty() {
        println!("{}", "No trigger labels found".dimmed());
    }
    for report in &batch.reports {
        println!("{}", report_line(report));
    }
    for (event, err) in &batch.errors {
        println!("{} {event}: {}", "✗".red(), format!("[{}] {err}", err.class()).red());
    }
    for root in completed {
        println!("{} workflow for #{root} complete", "🎉".green());
    }
    println!(
        "{}",
        format!(
            "{} processed, {} duplicate, {} failed",
            batch.count(Disposition::Processed),
            batch.count(Disposition::Duplicate),
            batch.errors.len() + batch.reports.iter().filter(|r| r.is_failure()).count()
        )
        .bold()
    );
    Ok(())
}

pub fn records(records: &[WorkflowRecord], format: OutputFormat) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        return print_json(records);
    }

    if records.is_empty() {
        println!("{}", "No workflows recorded".dimmed());
        return Ok(());
    }
    println!(
        "{}",
        format!("{:<8} {:<14} {:<10} {:>5}  {}", "ROOT", "STAGE", "PROPOSAL", "TASKS", "UPDATED").bold()
    );
    for record in records {
        let proposal = record
            .proposal_issue
            .as_ref()
            .map_or_else(|| "-".to_string(), |id| format!("#{id}"));
        println!(
            "{:<8} {:<14} {:<10} {:>5}  {}",
            format!("#{}", record.root_issue),
            stage_colored(record.stage),
            proposal,
            record.task_issues.len(),
            record.updated_at.format("%Y-%m-%d %H:%M").to_string().dimmed()
        );
    }
    Ok(())
}

pub fn record(record: &WorkflowRecord, format: OutputFormat) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        return print_json(record);
    }

    println!(
        "{} {}#{} ({})",
        "Workflow".bold(),
        record.repository,
        record.root_issue,
        record.backend
    );
    println!("  stage:    {}", stage_colored(record.stage));
    if let Some(proposal) = &record.proposal_issue {
        println!("  proposal: #{proposal}");
    }
    if let (Some(stage), Some(error)) = (record.failed_at_stage, &record.last_error) {
        println!("  failed in {}: {}", stage, error.red());
    }

    if !record.task_issues.is_empty() {
        println!("  tasks:");
        for (index, issue) in record.task_issues.iter().enumerate() {
            let title = record
                .planned_tasks
                .get(index)
                .map_or("", |t| t.title.as_str());
            let status = match record.task_run(issue) {
                Some(run) if run.merged => "merged".green(),
                Some(run) if run.change_request.is_some() => "in review".cyan(),
                Some(_) => "executing".yellow(),
                None => "pending".dimmed(),
            };
            println!("    {}. #{issue} {title} [{status}]", index + 1);
            if let Some(run) = record.task_run(issue) {
                if let Some(branch) = &run.branch {
                    println!("       branch {}", branch.dimmed());
                }
            }
        }
    }

    println!(
        "  updated:  {} (version {})",
        record.updated_at.to_rfc3339(),
        record.version
    );
    Ok(())
}

pub fn poll_summary(summary: &PollSummary, format: OutputFormat) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        return print_json(summary);
    }
    println!(
        "{}",
        format!(
            "Daemon stopped after {} tick(s): {} processed, {} duplicate, {} failed, {} completed",
            summary.ticks, summary.processed, summary.duplicates, summary.failures, summary.completed
        )
        .bold()
    );
    Ok(())
}
