//! Continuous poll mode.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::orchestrator::{BatchReport, Disposition, WorkflowOrchestrator};

/// Running totals over a daemon's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollSummary {
    pub ticks: u64,
    pub processed: usize,
    pub duplicates: usize,
    pub failures: usize,
    pub completed: usize,
}

impl PollSummary {
    fn record_batch(&mut self, batch: &BatchReport) {
        self.processed += batch.count(Disposition::Processed);
        self.duplicates += batch.count(Disposition::Duplicate);
        self.failures += batch.errors.len() + batch.reports.iter().filter(|r| r.is_failure()).count();
    }
}

/// Periodically discovers standing trigger labels and feeds them through
/// the orchestrator. Duplicates are filtered by the normal fingerprint path.
#[derive(Debug)]
pub struct Poller {
    orchestrator: Arc<WorkflowOrchestrator>,
    interval: Duration,
    only_label: Option<String>,
}

impl Poller {
    pub fn new(orchestrator: Arc<WorkflowOrchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
            only_label: None,
        }
    }

    /// Watch a single label instead of every trigger label.
    #[must_use]
    pub fn only_label(mut self, label: impl Into<String>) -> Self {
        self.only_label = Some(label.into());
        self
    }

    /// Poll until `shutdown` is cancelled. Intake stops immediately; events
    /// already started finish first.
    pub async fn run(&self, shutdown: CancellationToken) -> PollSummary {
        let mut summary = PollSummary::default();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = self.interval.as_secs(), "Poller started");
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.tick(&shutdown, &mut summary).await;
        }

        info!(
            ticks = summary.ticks,
            processed = summary.processed,
            failures = summary.failures,
            "Poller stopped"
        );
        summary
    }

    /// One discover, process, reconcile cycle.
    pub async fn tick(&self, shutdown: &CancellationToken, summary: &mut PollSummary) {
        summary.ticks += 1;

        match self.orchestrator.discover(self.only_label.as_deref()).await {
            Ok(events) if !events.is_empty() => {
                let batch = self
                    .orchestrator
                    .process_batch_until(events, shutdown)
                    .await;
                summary.record_batch(&batch);
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, class = %err.class(), "Discovery failed"),
        }

        if shutdown.is_cancelled() {
            return;
        }
        match self.orchestrator.reconcile_reviews().await {
            Ok(done) => summary.completed += done.len(),
            Err(err) => warn!(error = %err, "Review reconciliation failed"),
        }
    }
}
