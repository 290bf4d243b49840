//! Persisted per-issue workflow state.

use std::fmt;

use ai::TaskSpec;
use chrono::{DateTime, Utc};
use scm::{Backend, ChangeRequestId, IssueId, RepoRef};
use serde::{Deserialize, Serialize};

/// Bound on the remembered delivery fingerprints per record.
pub const FINGERPRINT_HISTORY: usize = 64;

/// Workflow stage. Declaration order is progression order; `Failed` sorts
/// last but is not "ahead" of anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    New,
    PlanProposed,
    TasksCreated,
    Executing,
    InReview,
    Done,
    Failed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::PlanProposed => "plan_proposed",
            Self::TasksCreated => "tasks_created",
            Self::Executing => "executing",
            Self::InReview => "in_review",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store key: one record per (repository, root issue).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub repository: RepoRef,
    pub root_issue: IssueId,
}

impl RecordKey {
    pub fn new(repository: RepoRef, root_issue: IssueId) -> Self {
        Self {
            repository,
            root_issue,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repository, self.root_issue)
    }
}

/// Branch, commit and change request produced for one task issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRun {
    pub issue: IssueId,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub committed: bool,
    #[serde(default)]
    pub change_request: Option<ChangeRequestId>,
    #[serde(default)]
    pub change_request_url: Option<String>,
    /// Completion comment posted on the task issue
    #[serde(default)]
    pub announced: bool,
    #[serde(default)]
    pub merged: bool,
}

impl TaskRun {
    fn new(issue: IssueId) -> Self {
        Self {
            issue,
            branch: None,
            committed: false,
            change_request: None,
            change_request_url: None,
            announced: false,
            merged: false,
        }
    }
}

/// Lifecycle of one root issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRecord {
    pub repository: RepoRef,
    pub root_issue: IssueId,
    pub backend: Backend,
    pub stage: Stage,
    #[serde(default)]
    pub proposal_issue: Option<IssueId>,
    /// Link comment posted on the root issue
    #[serde(default)]
    pub proposal_announced: bool,
    /// Checkpointed breakdown; task issues are created from it in order
    #[serde(default)]
    pub planned_tasks: Vec<TaskSpec>,
    /// Created task issues, in task order
    #[serde(default)]
    pub task_issues: Vec<IssueId>,
    #[serde(default)]
    pub tasks_announced: bool,
    #[serde(default)]
    pub task_runs: Vec<TaskRun>,
    /// Branch of the most recent task run
    #[serde(default)]
    pub feature_branch: Option<String>,
    /// Change request of the most recent task run
    #[serde(default)]
    pub merge_request: Option<ChangeRequestId>,
    #[serde(default)]
    pub last_event_fingerprint: Option<String>,
    /// Processed deliveries, oldest first
    #[serde(default)]
    pub seen_fingerprints: Vec<String>,
    /// Seen deliveries whose label labelflow removed afterwards
    #[serde(default)]
    pub cleared_fingerprints: Vec<String>,
    #[serde(default)]
    pub failed_at_stage: Option<Stage>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Save counter for optimistic concurrency; 0 means never saved
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRecord {
    pub fn new(backend: Backend, key: RecordKey) -> Self {
        let now = Utc::now();
        Self {
            repository: key.repository,
            root_issue: key.root_issue,
            backend,
            stage: Stage::New,
            proposal_issue: None,
            proposal_announced: false,
            planned_tasks: Vec::new(),
            task_issues: Vec::new(),
            tasks_announced: false,
            task_runs: Vec::new(),
            feature_branch: None,
            merge_request: None,
            last_event_fingerprint: None,
            seen_fingerprints: Vec::new(),
            cleared_fingerprints: Vec::new(),
            failed_at_stage: None,
            last_error: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.repository.clone(), self.root_issue.clone())
    }

    /// Whether `issue` is the root, the proposal or one of the tasks.
    pub fn contains_issue(&self, issue: &IssueId) -> bool {
        self.root_issue == *issue
            || self.proposal_issue.as_ref() == Some(issue)
            || self.task_issues.contains(issue)
            || self.task_runs.iter().any(|run| run.issue == *issue)
    }

    pub fn has_seen(&self, fingerprint: &str) -> bool {
        self.seen_fingerprints.iter().any(|f| f == fingerprint)
    }

    /// Record a processed delivery.
    pub fn remember(&mut self, fingerprint: &str) {
        self.seen_fingerprints.retain(|f| f != fingerprint);
        self.seen_fingerprints.push(fingerprint.to_string());
        if self.seen_fingerprints.len() > FINGERPRINT_HISTORY {
            let excess = self.seen_fingerprints.len() - FINGERPRINT_HISTORY;
            self.seen_fingerprints.drain(..excess);
            let seen = &self.seen_fingerprints;
            self.cleared_fingerprints.retain(|f| seen.contains(f));
        }
        self.cleared_fingerprints.retain(|f| f != fingerprint);
        self.last_event_fingerprint = Some(fingerprint.to_string());
    }

    /// Note that the label of a seen delivery was taken off the issue.
    /// A later identical delivery is only a duplicate while the label
    /// stays off.
    pub fn clear(&mut self, fingerprint: &str) {
        if self.has_seen(fingerprint) && !self.was_cleared(fingerprint) {
            self.cleared_fingerprints.push(fingerprint.to_string());
        }
    }

    pub fn was_cleared(&self, fingerprint: &str) -> bool {
        self.cleared_fingerprints.iter().any(|f| f == fingerprint)
    }

    /// Drop a delivery so the same label change is processed again.
    /// Returns whether it was present.
    pub fn forget(&mut self, fingerprint: &str) -> bool {
        let before = self.seen_fingerprints.len();
        self.seen_fingerprints.retain(|f| f != fingerprint);
        self.cleared_fingerprints.retain(|f| f != fingerprint);
        self.last_event_fingerprint = self.seen_fingerprints.last().cloned();
        before != self.seen_fingerprints.len()
    }

    /// Move forward to `stage`. Never moves backwards and never leaves
    /// `Failed`; returns whether the stage changed.
    pub fn advance(&mut self, stage: Stage) -> bool {
        if self.stage == Stage::Failed || stage == Stage::Failed || stage <= self.stage {
            return false;
        }
        self.stage = stage;
        true
    }

    /// Enter `Failed`, remembering where from.
    pub fn fail(&mut self, error: impl Into<String>) {
        if self.stage != Stage::Failed {
            self.failed_at_stage = Some(self.stage);
        }
        self.stage = Stage::Failed;
        self.last_error = Some(error.into());
    }

    /// Undo a failure: restore the stage the record failed in.
    pub fn rollback(&mut self) -> Option<Stage> {
        if self.stage != Stage::Failed {
            return None;
        }
        let restored = self.failed_at_stage.take().unwrap_or(Stage::New);
        self.stage = restored;
        self.last_error = None;
        Some(restored)
    }

    /// Start over at `New`, keeping identity and delivery history.
    pub fn restart(&mut self) {
        self.stage = Stage::New;
        self.proposal_issue = None;
        self.proposal_announced = false;
        self.planned_tasks.clear();
        self.task_issues.clear();
        self.tasks_announced = false;
        self.task_runs.clear();
        self.feature_branch = None;
        self.merge_request = None;
        self.failed_at_stage = None;
        self.last_error = None;
    }

    pub fn task_run(&self, issue: &IssueId) -> Option<&TaskRun> {
        self.task_runs.iter().find(|run| run.issue == *issue)
    }

    /// Index of the run for `issue`, creating an empty one if needed.
    pub fn ensure_task_run(&mut self, issue: &IssueId) -> usize {
        if let Some(pos) = self.task_runs.iter().position(|run| run.issue == *issue) {
            return pos;
        }
        self.task_runs.push(TaskRun::new(issue.clone()));
        self.task_runs.len() - 1
    }

    /// 1-based position of `issue` among the tasks.
    pub fn task_number(&self, issue: &IssueId) -> Option<usize> {
        self.task_issues
            .iter()
            .position(|t| t == issue)
            .map(|pos| pos + 1)
    }

    /// Whether every task has a merged change request.
    ///
    /// Records without task issues (a task executed directly on the root)
    /// count their runs instead.
    pub fn all_merged(&self) -> bool {
        let expected: Vec<&IssueId> = if self.task_issues.is_empty() {
            self.task_runs.iter().map(|run| &run.issue).collect()
        } else {
            self.task_issues.iter().collect()
        };

        !expected.is_empty()
            && expected
                .iter()
                .all(|issue| self.task_run(issue).is_some_and(|run| run.merged))
    }

    /// Carry this record's changes onto a fresher copy that won a save race.
    ///
    /// Our fields win; list fields keep entries only the fresh copy has.
    pub fn reapply_onto(&self, fresh: &Self) -> Self {
        let mut merged = self.clone();
        merged.version = fresh.version;
        merged.created_at = fresh.created_at;

        for issue in &fresh.task_issues {
            if !merged.task_issues.contains(issue) {
                merged.task_issues.push(issue.clone());
            }
        }
        for run in &fresh.task_runs {
            if merged.task_run(&run.issue).is_none() {
                merged.task_runs.push(run.clone());
            }
        }
        let ours = std::mem::take(&mut merged.seen_fingerprints);
        let mut seen: Vec<String> = fresh
            .seen_fingerprints
            .iter()
            .filter(|f| !ours.contains(f))
            .cloned()
            .collect();
        seen.extend(ours);
        merged.seen_fingerprints = seen;
        if let Some(last) = merged.seen_fingerprints.last().cloned() {
            merged.remember(&last);
        }

        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> WorkflowRecord {
        WorkflowRecord::new(
            Backend::GitHub,
            RecordKey::new(RepoRef::new("acme", "widgets"), IssueId::new("42")),
        )
    }

    #[test]
    fn test_stage_only_moves_forward() {
        let mut r = record();
        assert!(r.advance(Stage::PlanProposed));
        assert!(r.advance(Stage::InReview));
        assert!(!r.advance(Stage::Executing));
        assert_eq!(r.stage, Stage::InReview);
        assert!(!r.advance(Stage::Failed));
    }

    #[test]
    fn test_fail_and_rollback() {
        let mut r = record();
        r.advance(Stage::TasksCreated);
        r.fail("agent returned garbage");

        assert_eq!(r.stage, Stage::Failed);
        assert!(!r.advance(Stage::Executing));
        assert_eq!(r.rollback(), Some(Stage::TasksCreated));
        assert_eq!(r.last_error, None);
        assert_eq!(r.rollback(), None);
    }

    #[test]
    fn test_fingerprint_history_is_bounded() {
        let mut r = record();
        for i in 0..(FINGERPRINT_HISTORY + 10) {
            r.remember(&format!("fp-{i}"));
        }
        assert_eq!(r.seen_fingerprints.len(), FINGERPRINT_HISTORY);
        assert!(!r.has_seen("fp-0"));
        assert!(r.has_seen(&format!("fp-{}", FINGERPRINT_HISTORY + 9)));
        assert_eq!(
            r.last_event_fingerprint.as_deref(),
            r.seen_fingerprints.last().map(String::as_str)
        );
    }

    #[test]
    fn test_forget_updates_tail() {
        let mut r = record();
        r.remember("a");
        r.remember("b");
        assert!(r.forget("b"));
        assert_eq!(r.last_event_fingerprint.as_deref(), Some("a"));
        assert!(!r.forget("b"));
    }

    #[test]
    fn test_contains_member_issues() {
        let mut r = record();
        r.proposal_issue = Some(IssueId::new("43"));
        r.task_issues.push(IssueId::new("44"));

        assert!(r.contains_issue(&IssueId::new("42")));
        assert!(r.contains_issue(&IssueId::new("43")));
        assert!(r.contains_issue(&IssueId::new("44")));
        assert!(!r.contains_issue(&IssueId::new("45")));
        assert_eq!(r.task_number(&IssueId::new("44")), Some(1));
    }

    #[test]
    fn test_all_merged_requires_every_task() {
        let mut r = record();
        r.task_issues = vec![IssueId::new("44"), IssueId::new("45")];
        assert!(!r.all_merged());

        let first = r.ensure_task_run(&IssueId::new("44"));
        r.task_runs[first].merged = true;
        assert!(!r.all_merged());

        let second = r.ensure_task_run(&IssueId::new("45"));
        r.task_runs[second].merged = true;
        assert!(r.all_merged());
    }

    #[test]
    fn test_reapply_keeps_fresh_only_entries() {
        let mut ours = record();
        ours.remember("ours");
        ours.task_issues.push(IssueId::new("44"));

        let mut fresh = record();
        fresh.version = 7;
        fresh.remember("theirs");
        fresh.task_issues.push(IssueId::new("50"));

        let merged = ours.reapply_onto(&fresh);
        assert_eq!(merged.version, 7);
        assert!(merged.has_seen("ours"));
        assert!(merged.has_seen("theirs"));
        assert_eq!(merged.last_event_fingerprint.as_deref(), Some("ours"));
        assert_eq!(merged.task_issues.len(), 2);
    }

    #[test]
    fn test_clear_only_marks_seen_deliveries() {
        let mut r = record();
        r.clear("never-seen");
        assert!(!r.was_cleared("never-seen"));

        r.remember("needs-planning");
        r.clear("needs-planning");
        r.clear("needs-planning");
        assert!(r.was_cleared("needs-planning"));
        assert_eq!(r.cleared_fingerprints.len(), 1);
        assert!(r.has_seen("needs-planning"));

        // Processing the delivery again makes it a plain duplicate
        r.remember("needs-planning");
        assert!(!r.was_cleared("needs-planning"));

        r.clear("needs-planning");
        assert!(r.forget("needs-planning"));
        assert!(!r.was_cleared("needs-planning"));
    }

    #[test]
    fn test_cleared_follows_history_bound() {
        let mut r = record();
        r.remember("old");
        r.clear("old");
        for i in 0..FINGERPRINT_HISTORY {
            r.remember(&format!("fp-{i}"));
        }
        assert!(!r.has_seen("old"));
        assert!(r.cleared_fingerprints.is_empty());
    }

    #[test]
    fn test_reapply_orders_fresh_before_ours_without_repeats() {
        let mut ours = record();
        ours.remember("shared");
        ours.remember("ours");

        let mut fresh = record();
        fresh.remember("theirs");
        fresh.remember("shared");

        let merged = ours.reapply_onto(&fresh);
        assert_eq!(merged.seen_fingerprints, ["theirs", "shared", "ours"]);
    }

    #[test]
    fn test_older_records_deserialize() {
        let json = r#"{
            "repository": {"owner": "acme", "name": "widgets"},
            "rootIssue": "42",
            "backend": "gitlab",
            "stage": "plan_proposed",
            "createdAt": "2026-01-01T00:00:00Z",
            "updatedAt": "2026-01-01T00:00:00Z"
        }"#;
        let r: WorkflowRecord = serde_json::from_str(json).unwrap();
        assert_eq!(r.stage, Stage::PlanProposed);
        assert_eq!(r.version, 0);
        assert!(r.task_runs.is_empty());
    }
}
