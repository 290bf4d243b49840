//! labelflow CLI - label-triggered planning, task breakdown and execution.

mod bootstrap;
mod output;
mod secrets;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use scm::IssueId;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use workflow::{
    BatchReport, ConfigError, ErrorClass, EventReport, HandlerKind, HandlerStatus, LabelAction,
    LabelEvent, LabelflowConfig, Poller, RecordKey, WorkflowError, WorkflowOrchestrator,
};

use output::OutputFormat;

/// Exit status for configuration and other prerequisite errors.
const EXIT_CONFIG: u8 = 2;

/// labelflow - drive issues from plan to change request with labels.
#[derive(Parser)]
#[command(name = "labelflow")]
#[command(about = "Label-triggered workflow engine for GitHub, GitLab and Gitea")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, env = "LABELFLOW_CONFIG", default_value = "labelflow.yaml")]
    config: PathBuf,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Log format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

fn parse_action(value: &str) -> Result<LabelAction, String> {
    value.parse()
}

#[derive(Subcommand)]
enum Commands {
    /// Draft a proposal for an issue, as if it had been labeled for planning
    ProcessIssue {
        /// Issue number
        issue: String,
    },

    /// Process a single label event
    ProcessLabel {
        /// `labeled` or `unlabeled`
        #[arg(long, value_parser = parse_action)]
        event_type: LabelAction,

        /// Label name
        #[arg(long)]
        label: String,

        /// Issue number
        #[arg(long)]
        issue: String,
    },

    /// Process every open issue carrying a trigger label
    ProcessAll {
        /// Only this label
        #[arg(long)]
        tag: Option<String>,
    },

    /// Create the tasks for an approved plan issue
    ProcessPlan {
        /// Plan issue number
        plan: String,
    },

    /// Poll for trigger labels until interrupted
    Daemon {
        /// Seconds between polls (defaults to daemon.intervalSecs)
        #[arg(long)]
        interval: Option<u64>,

        /// Only this label
        #[arg(long)]
        tag: Option<String>,
    },

    /// List recorded workflows
    ListPlans,

    /// Show one workflow by any of its issues
    ShowPlan {
        /// Root, proposal or task issue number
        issue: String,
    },
}

fn init_tracing(verbose: bool, log_format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("labelflow=debug,workflow=debug,scm=debug,ai=debug,info")
        } else {
            EnvFilter::new("labelflow=info,workflow=info,warn")
        }
    });

    let registry = tracing_subscriber::registry().with(filter);
    match log_format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                token.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });
}

/// Exit status for a failure class surfaced in one-shot mode.
fn exit_for_class(class: ErrorClass) -> ExitCode {
    if class == ErrorClass::Configuration {
        ExitCode::from(EXIT_CONFIG)
    } else {
        ExitCode::FAILURE
    }
}

fn exit_for_report(report: &EventReport) -> ExitCode {
    match &report.outcome {
        Some(outcome) if outcome.status != HandlerStatus::Succeeded => outcome
            .error
            .as_ref()
            .map_or(ExitCode::FAILURE, |e| exit_for_class(e.class)),
        _ => ExitCode::SUCCESS,
    }
}

fn exit_for_batch(batch: &BatchReport) -> ExitCode {
    let classes = batch
        .errors
        .iter()
        .map(|(_, err)| err.class())
        .chain(
            batch
                .reports
                .iter()
                .filter(|r| r.is_failure())
                .filter_map(|r| r.outcome.as_ref()?.error.as_ref().map(|e| e.class)),
        )
        .collect::<Vec<_>>();

    if classes.contains(&ErrorClass::Configuration) {
        ExitCode::from(EXIT_CONFIG)
    } else if batch.has_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

struct App {
    config: LabelflowConfig,
    format: OutputFormat,
}

impl App {
    fn orchestrator(&self) -> Result<Arc<WorkflowOrchestrator>> {
        let store = bootstrap::open_store(&self.config);
        let orchestrator = bootstrap::orchestrator(&self.config, store)
            .context("failed to initialise orchestrator")?;
        Ok(Arc::new(orchestrator))
    }

    async fn process_one(
        &self,
        orchestrator: &WorkflowOrchestrator,
        event: LabelEvent,
    ) -> Result<ExitCode> {
        let report = orchestrator
            .process_event(event)
            .await
            .context("failed to process event")?;
        output::event_report(&report, self.format)?;
        Ok(exit_for_report(&report))
    }

    async fn synthesize(&self, kind: HandlerKind, issue: String) -> Result<ExitCode> {
        let orchestrator = self.orchestrator()?;
        let event = orchestrator.synthesize(kind, IssueId::new(issue))?;
        info!(event = %event, "Synthesized label event");
        self.process_one(&orchestrator, event).await
    }

    async fn process_label(
        &self,
        action: LabelAction,
        label: String,
        issue: String,
    ) -> Result<ExitCode> {
        let event = LabelEvent {
            backend: self.config.provider.kind,
            repository: self.config.repo(),
            issue: IssueId::new(issue),
            label,
            action,
        };
        let orchestrator = self.orchestrator()?;
        self.process_one(&orchestrator, event).await
    }

    async fn process_all(&self, tag: Option<String>) -> Result<ExitCode> {
        let orchestrator = self.orchestrator()?;
        let shutdown = CancellationToken::new();
        cancel_on_interrupt(shutdown.clone());

        let events = orchestrator
            .discover(tag.as_deref())
            .await
            .context("failed to discover labeled issues")?;
        info!(count = events.len(), "Discovered trigger labels");

        let batch = orchestrator.process_batch_until(events, &shutdown).await;
        let completed = if shutdown.is_cancelled() {
            Vec::new()
        } else {
            orchestrator
                .reconcile_reviews()
                .await
                .context("failed to reconcile change requests")?
        };

        output::batch_report(&batch, &completed, self.format)?;
        Ok(exit_for_batch(&batch))
    }

    async fn daemon(&self, interval: Option<u64>, tag: Option<String>) -> Result<ExitCode> {
        let orchestrator = self.orchestrator()?;
        let interval = interval.map_or_else(|| self.config.poll_interval(), Duration::from_secs);
        if interval.is_zero() {
            return Err(ConfigError::Invalid("--interval must be at least 1".to_string()).into());
        }

        let shutdown = CancellationToken::new();
        cancel_on_interrupt(shutdown.clone());

        let mut poller = Poller::new(orchestrator, interval);
        if let Some(tag) = tag {
            info!(label = %tag, "Watching a single label");
            poller = poller.only_label(tag);
        }
        let summary = poller.run(shutdown).await;
        output::poll_summary(&summary, self.format)?;
        Ok(ExitCode::SUCCESS)
    }

    async fn list_plans(&self) -> Result<ExitCode> {
        let store = bootstrap::open_store(&self.config);
        let records = store
            .list(&self.config.repo())
            .await
            .context("failed to read workflow state")?;
        output::records(&records, self.format)?;
        Ok(ExitCode::SUCCESS)
    }

    async fn show_plan(&self, issue: String) -> Result<ExitCode> {
        let store = bootstrap::open_store(&self.config);
        let repository = self.config.repo();
        let issue = IssueId::new(issue);

        let found = match store.find_by_issue(&repository, &issue).await? {
            Some(record) => Some(record),
            None => store.load(&RecordKey::new(repository, issue.clone())).await?,
        };
        let Some(record) = found else {
            eprintln!("{}", format!("No workflow includes issue #{issue}").red());
            return Ok(ExitCode::FAILURE);
        };

        output::record(&record, self.format)?;
        Ok(ExitCode::SUCCESS)
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = bootstrap::load_config(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let app = App {
        config,
        format: cli.format,
    };

    match cli.command {
        Commands::ProcessIssue { issue } => app.synthesize(HandlerKind::Proposal, issue).await,
        Commands::ProcessLabel {
            event_type,
            label,
            issue,
        } => app.process_label(event_type, label, issue).await,
        Commands::ProcessAll { tag } => app.process_all(tag).await,
        Commands::ProcessPlan { plan } => app.synthesize(HandlerKind::Approval, plan).await,
        Commands::Daemon { interval, tag } => app.daemon(interval, tag).await,
        Commands::ListPlans => app.list_plans().await,
        Commands::ShowPlan { issue } => app.show_plan(issue).await,
    }
}

/// Configuration problems anywhere in the chain exit with status 2.
fn is_config_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.is::<ConfigError>()
            || cause
                .downcast_ref::<WorkflowError>()
                .is_some_and(|e| e.class() == ErrorClass::Configuration)
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "labelflow failed");
            eprintln!("{} {err:#}", "error:".red().bold());
            if is_config_error(&err) {
                ExitCode::from(EXIT_CONFIG)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
