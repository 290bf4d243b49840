//! # Workflow Orchestrator
//!
//! Drives label events through the stage machine:
//!
//! ```text
//! New -> PlanProposed -> TasksCreated -> Executing -> InReview -> Done
//!                                                         (any) -> Failed
//! ```
//!
//! One event at a time per record (per-record lock), many records at once
//! (bounded worker pool). Every delivery is fingerprinted; a fingerprint the
//! record has already processed short-circuits without touching remote
//! state.

use std::collections::HashSet;
use std::sync::Arc;

use scm::{ChangeRequestFilter, ChangeRequestState, IssueFilter, IssueId, IssueState};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{WorkflowError, WorkflowResult};
use crate::event::{LabelAction, LabelEvent};
use crate::handlers::{handler_for, HandlerContext, HandlerOutcome, HandlerStatus, Services};
use crate::lock::{IssueGuard, IssueLocks};
use crate::record::{RecordKey, Stage, WorkflowRecord};
use crate::router::LabelEventRouter;
use crate::trigger::{HandlerKind, LabelTrigger};

/// Default worker pool size.
pub const DEFAULT_WORKERS: usize = 4;

/// How an event was disposed of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// A handler ran (its outcome says how it went)
    Processed,
    /// Already processed for this record
    Duplicate,
    /// No trigger matches the label
    NoMatch,
    /// Label removal; only duplicate history was touched
    Unlabeled,
}

/// Result of one event.
#[derive(Debug, Clone, Serialize)]
pub struct EventReport {
    pub event: LabelEvent,
    pub disposition: Disposition,
    pub trigger: Option<String>,
    pub root_issue: Option<IssueId>,
    pub stage: Option<Stage>,
    pub outcome: Option<HandlerOutcome>,
}

impl EventReport {
    fn new(event: LabelEvent, disposition: Disposition) -> Self {
        Self {
            event,
            disposition,
            trigger: None,
            root_issue: None,
            stage: None,
            outcome: None,
        }
    }

    fn with_record(mut self, record: &WorkflowRecord) -> Self {
        self.root_issue = Some(record.root_issue.clone());
        self.stage = Some(record.stage);
        self
    }

    /// Whether a handler ran and did not succeed.
    pub fn is_failure(&self) -> bool {
        self.outcome.as_ref().is_some_and(|o| !o.is_success())
    }
}

/// Reports and errors of a batch.
#[derive(Debug, Default, Serialize)]
pub struct BatchReport {
    pub reports: Vec<EventReport>,
    /// Events that could not be processed at all
    #[serde(serialize_with = "serialize_errors")]
    pub errors: Vec<(LabelEvent, WorkflowError)>,
}

fn serialize_errors<S: serde::Serializer>(
    errors: &[(LabelEvent, WorkflowError)],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    use serde::ser::SerializeSeq;

    let mut seq = serializer.serialize_seq(Some(errors.len()))?;
    for (event, err) in errors {
        seq.serialize_element(&serde_json::json!({
            "event": event,
            "class": err.class(),
            "error": err.to_string(),
        }))?;
    }
    seq.end()
}

impl BatchReport {
    pub fn has_failures(&self) -> bool {
        !self.errors.is_empty() || self.reports.iter().any(EventReport::is_failure)
    }

    pub fn count(&self, disposition: Disposition) -> usize {
        self.reports
            .iter()
            .filter(|r| r.disposition == disposition)
            .count()
    }
}

/// Label-driven workflow engine.
pub struct WorkflowOrchestrator {
    services: Arc<Services>,
    router: LabelEventRouter,
    locks: IssueLocks,
    workers: usize,
}

impl std::fmt::Debug for WorkflowOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowOrchestrator")
            .field("services", &self.services)
            .field("triggers", &self.router.triggers().len())
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl WorkflowOrchestrator {
    pub fn new(services: Services, triggers: Vec<LabelTrigger>) -> Self {
        Self {
            services: Arc::new(services),
            router: LabelEventRouter::new(triggers),
            locks: IssueLocks::new(),
            workers: DEFAULT_WORKERS,
        }
    }

    /// Bound the number of events processed concurrently.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn router(&self) -> &LabelEventRouter {
        &self.router
    }

    fn event_for(&self, issue: IssueId, label: &str) -> LabelEvent {
        LabelEvent::added(
            self.services.git.backend(),
            self.services.settings.repository.clone(),
            issue,
            label,
        )
    }

    /// Label-added event for the first exact trigger of `kind`.
    pub fn synthesize(&self, kind: HandlerKind, issue: IssueId) -> WorkflowResult<LabelEvent> {
        let label = self
            .router
            .triggers()
            .iter()
            .filter(|t| t.handler == kind)
            .find_map(LabelTrigger::exact_label)
            .ok_or_else(|| {
                crate::config::ConfigError::Invalid(format!(
                    "no {kind} trigger with an exact label is configured"
                ))
            })?;
        Ok(self.event_for(issue, label))
    }

    /// Process one label event end to end.
    #[instrument(skip(self, event), fields(issue = %event.issue, label = %event.label, action = %event.action))]
    pub async fn process_event(&self, event: LabelEvent) -> WorkflowResult<EventReport> {
        if event.action == LabelAction::Removed {
            return self.process_removal(event).await;
        }

        let Some(trigger) = self.router.route(&event) else {
            debug!("No trigger matches label");
            return Ok(EventReport::new(event, Disposition::NoMatch));
        };

        let (_guard, mut record) = match self.lock_record(&event, trigger.handler).await {
            Ok(locked) => locked,
            Err(err) => return Err(self.surface(&event, err).await),
        };
        let fingerprint = event.fingerprint();
        let mut report = EventReport::new(event.clone(), Disposition::Processed);
        report.trigger = Some(trigger.name.clone());

        if record.has_seen(&fingerprint) {
            let relabeled = record.was_cleared(&fingerprint)
                && match self.label_present(&event).await {
                    Ok(present) => present,
                    Err(err) => return Err(self.surface(&event, err).await),
                };
            if !relabeled {
                info!(root = %record.root_issue, "Duplicate delivery, skipping");
                report.disposition = Disposition::Duplicate;
                return Ok(report.with_record(&record));
            }
            info!(root = %record.root_issue, "Label re-applied after removal, processing again");
            record.forget(&fingerprint);
        }

        if trigger.handler == HandlerKind::Proposal
            && event.issue == record.root_issue
            && record.stage.is_terminal()
        {
            info!(stage = %record.stage, "Restarting finished workflow");
            record.restart();
        } else if let Some(restored) = record.rollback() {
            info!(stage = %restored, "Rolled back failed workflow");
        }

        let outcome = self.run_handler(&event, trigger, &mut record).await;
        let outcome = self.settle(&event, &fingerprint, &mut record, outcome).await?;

        info!(
            root = %record.root_issue,
            stage = %record.stage,
            status = ?outcome.status,
            "Event processed"
        );
        report.outcome = Some(outcome);
        Ok(report.with_record(&record))
    }

    /// Forget the matching label-added delivery so re-adding the label runs
    /// the handler again.
    async fn process_removal(&self, event: LabelEvent) -> WorkflowResult<EventReport> {
        let repository = &self.services.settings.repository;
        let Some(found) = self
            .services
            .store
            .find_by_issue(repository, &event.issue)
            .await?
        else {
            return Ok(EventReport::new(event, Disposition::Unlabeled));
        };

        let key = found.key();
        let _guard = self.locks.acquire(&key).await;
        let Some(mut record) = self.services.store.load(&key).await? else {
            return Ok(EventReport::new(event, Disposition::Unlabeled));
        };

        if record.forget(&event.fingerprint_for(LabelAction::Added)) {
            debug!(root = %record.root_issue, "Forgot label-added delivery");
            self.save(&mut record).await?;
        }
        Ok(EventReport::new(event, Disposition::Unlabeled).with_record(&record))
    }

    /// Lock the record the event belongs to and load it under the lock.
    ///
    /// The record is re-resolved after locking; if it turns out to live
    /// under another key (created concurrently), the lock is swapped.
    async fn lock_record(
        &self,
        event: &LabelEvent,
        kind: HandlerKind,
    ) -> WorkflowResult<(IssueGuard, WorkflowRecord)> {
        let mut key = self.resolve(event, kind).await?.map_or_else(
            || RecordKey::new(event.repository.clone(), event.issue.clone()),
            |r| r.key(),
        );

        for _ in 0..3 {
            let guard = self.locks.acquire(&key).await;
            match self.resolve(event, kind).await? {
                Some(record) if record.key() == key => return Ok((guard, record)),
                Some(record) => {
                    debug!(from = %key, to = %record.key(), "Record moved, relocking");
                    key = record.key();
                }
                None if key.root_issue == event.issue => {
                    return Ok((guard, WorkflowRecord::new(event.backend, key)));
                }
                None => key = RecordKey::new(event.repository.clone(), event.issue.clone()),
            }
        }

        Err(WorkflowError::Contended(key.to_string()))
    }

    /// Proposals root at the labeled issue; everything else joins the record
    /// the issue is a member of.
    async fn resolve(
        &self,
        event: &LabelEvent,
        kind: HandlerKind,
    ) -> WorkflowResult<Option<WorkflowRecord>> {
        let store = &self.services.store;
        let record = match kind {
            HandlerKind::Proposal => {
                store
                    .load(&RecordKey::new(event.repository.clone(), event.issue.clone()))
                    .await?
            }
            HandlerKind::Approval | HandlerKind::TaskExecution => {
                store.find_by_issue(&event.repository, &event.issue).await?
            }
        };
        Ok(record)
    }

    async fn run_handler(
        &self,
        event: &LabelEvent,
        trigger: &LabelTrigger,
        record: &mut WorkflowRecord,
    ) -> HandlerOutcome {
        let services = self.services.as_ref();
        let git = services.git.as_ref();
        let id = &event.issue;

        let issue = match services.call_git("get_issue", move || git.get_issue(id)).await {
            Ok(issue) => issue,
            Err(err) => {
                error!(error = %err, "Failed to load triggering issue");
                services.report_failure(id, &err).await;
                return HandlerOutcome::succeeded().into_failure(&err);
            }
        };

        let ctx = HandlerContext {
            event,
            issue: &issue,
            trigger,
            services,
        };
        handler_for(trigger.handler).handle(ctx, record).await
    }

    /// Persist the result of a handler run and apply its labels.
    ///
    /// Errors returned from here have already been reported on the issue.
    async fn settle(
        &self,
        event: &LabelEvent,
        fingerprint: &str,
        record: &mut WorkflowRecord,
        outcome: HandlerOutcome,
    ) -> WorkflowResult<HandlerOutcome> {
        let outcome = if outcome.is_success() {
            if let Err(err) = self.save(record).await {
                return Err(self.surface(event, err).await);
            }

            let applied = self
                .services
                .set_labels(&event.issue, &outcome.labels_to_add, &outcome.labels_to_remove)
                .await;
            match applied {
                Ok(()) => {
                    record.remember(fingerprint);
                    for label in &outcome.labels_to_remove {
                        record.clear(&event.with_label(label).fingerprint());
                    }
                    if let Err(err) = self.save(record).await {
                        return Err(self.surface(event, err).await);
                    }
                    return Ok(outcome);
                }
                Err(err) => {
                    warn!(error = %err, "Failed to apply label transition");
                    self.services.report_failure(&event.issue, &err).await;
                    outcome.into_failure(&err)
                }
            }
        } else {
            outcome
        };

        // Retryable failures leave the fingerprint unset so the next delivery runs again
        if outcome.status == HandlerStatus::Failed {
            let message = outcome
                .error
                .as_ref()
                .map_or_else(|| "handler failed".to_string(), |e| e.message.clone());
            record.fail(message);
            record.remember(fingerprint);
            self.save(record).await?;
        }
        Ok(outcome)
    }

    /// Report an error that ends processing of `event` on its issue.
    async fn surface(&self, event: &LabelEvent, err: WorkflowError) -> WorkflowError {
        error!(class = %err.class(), error = %err, "Event could not be completed");
        self.services.report_failure(&event.issue, &err).await;
        err
    }

    /// Whether the event's label is on its issue right now.
    async fn label_present(&self, event: &LabelEvent) -> WorkflowResult<bool> {
        let git = self.services.git.as_ref();
        let id = &event.issue;
        let issue = self
            .services
            .call_git("get_issue", move || git.get_issue(id))
            .await?;
        Ok(issue.has_label(&event.label))
    }

    /// Save; on a version conflict reapply onto the stored copy once.
    async fn save(&self, record: &mut WorkflowRecord) -> WorkflowResult<()> {
        let store = &self.services.store;
        match store.save(record).await {
            Err(err) if err.is_conflict() => {
                warn!(root = %record.root_issue, "Record changed concurrently, reapplying");
                let Some(fresh) = store.load(&record.key()).await? else {
                    return Err(err.into());
                };
                *record = record.reapply_onto(&fresh);
                store.save(record).await.map_err(WorkflowError::from)
            }
            other => other.map_err(WorkflowError::from),
        }
    }

    /// Process events concurrently until done.
    pub async fn process_batch(self: &Arc<Self>, events: Vec<LabelEvent>) -> BatchReport {
        self.process_batch_until(events, &CancellationToken::new())
            .await
    }

    /// Process events on the worker pool. Cancelling `shutdown` stops
    /// intake; events already started run to completion.
    pub async fn process_batch_until(
        self: &Arc<Self>,
        events: Vec<LabelEvent>,
        shutdown: &CancellationToken,
    ) -> BatchReport {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut jobs = JoinSet::new();

        for event in events {
            let permit = tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    info!("Shutdown requested, not starting further events");
                    break;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let this = Arc::clone(self);
            jobs.spawn(async move {
                let _permit = permit;
                let result = this.process_event(event.clone()).await;
                (event, result)
            });
        }

        let mut batch = BatchReport::default();
        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok((_, Ok(report))) => batch.reports.push(report),
                Ok((event, Err(err))) => {
                    error!(event = %event, class = %err.class(), error = %err, "Event failed");
                    batch.errors.push((event, err));
                }
                Err(join_err) => error!(error = %join_err, "Event task panicked"),
            }
        }
        batch
    }

    /// Label-added events for every open issue carrying a trigger label.
    ///
    /// `only_label` restricts discovery to one label. Glob triggers are
    /// matched against every label of every open issue.
    pub async fn discover(&self, only_label: Option<&str>) -> WorkflowResult<Vec<LabelEvent>> {
        let services = self.services.as_ref();
        let git = services.git.as_ref();
        let mut seen = HashSet::new();
        let mut events = Vec::new();

        let labels = match only_label {
            Some(label) => vec![label],
            None => self.router.discovery_labels(),
        };
        for label in labels {
            let filter = IssueFilter::open_with_label(label);
            let filter = &filter;
            let issues = services
                .call_git("list_issues", move || git.list_issues(filter))
                .await?;
            for issue in issues {
                if seen.insert((issue.id.clone(), label.to_string())) {
                    events.push(self.event_for(issue.id, label));
                }
            }
        }

        if only_label.is_none() && self.router.has_globs() {
            let filter = IssueFilter {
                state: Some(IssueState::Open),
                ..IssueFilter::default()
            };
            let filter = &filter;
            let issues = services
                .call_git("list_issues", move || git.list_issues(filter))
                .await?;
            for issue in issues {
                for label in &issue.labels {
                    let glob_match = self
                        .router
                        .match_label(label)
                        .is_some_and(|t| t.pattern.is_glob());
                    if glob_match && seen.insert((issue.id.clone(), label.clone())) {
                        events.push(self.event_for(issue.id.clone(), label));
                    }
                }
            }
        }

        debug!(count = events.len(), "Discovered label events");
        Ok(events)
    }

    /// Move `InReview` records whose change requests are all merged to
    /// `Done`. Returns the completed root issues.
    #[instrument(skip(self))]
    pub async fn reconcile_reviews(&self) -> WorkflowResult<Vec<IssueId>> {
        let services = self.services.as_ref();
        let git = services.git.as_ref();
        let candidates = services.store.list(&services.settings.repository).await?;
        let mut completed = Vec::new();

        for candidate in candidates.into_iter().filter(|r| r.stage == Stage::InReview) {
            let key = candidate.key();
            let _guard = self.locks.acquire(&key).await;
            let Some(mut record) = services.store.load(&key).await? else {
                continue;
            };
            if record.stage != Stage::InReview {
                continue;
            }

            let mut changed = false;
            for run in &mut record.task_runs {
                let (Some(branch), Some(id)) = (run.branch.as_deref(), run.change_request.as_ref())
                else {
                    continue;
                };
                if run.merged {
                    continue;
                }
                let filter = ChangeRequestFilter::from_branch(branch);
                let filter = &filter;
                let merged = services
                    .call_git("list_change_requests", move || {
                        git.list_change_requests(filter)
                    })
                    .await?
                    .iter()
                    .any(|cr| cr.id == *id && cr.state == ChangeRequestState::Merged);
                if merged {
                    run.merged = true;
                    changed = true;
                }
            }

            if !changed {
                continue;
            }
            if record.all_merged() {
                record.advance(Stage::Done);
                let count = record.task_runs.len();
                let body = format!(
                    "🎉 All {count} change request(s) for this issue are merged. Workflow complete."
                );
                if let Err(err) = services.comment(&record.root_issue, &body).await {
                    warn!(root = %record.root_issue, error = %err, "Failed to post completion comment");
                }
                info!(root = %record.root_issue, "Workflow complete");
                completed.push(record.root_issue.clone());
            }
            self.save(&mut record).await?;
        }

        Ok(completed)
    }
}
