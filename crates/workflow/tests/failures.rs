//! Failure classification, reporting and resumption.

mod common;

use ai::AiError;
use std::sync::Arc;

use common::{FlakyStore, Harness, Setup, StoreFault};
use scm::{IssueId, ScmError};
use workflow::{Disposition, ErrorClass, HandlerStatus, RecordKey, Stage, StateStore};

const ROOT_BODY: &str = "We need CSV export for reports.";

fn transient() -> ScmError {
    ScmError::Transient("502 bad gateway".into())
}

async fn proposal_for(h: &Harness, root: &IssueId) -> IssueId {
    let report = h
        .orchestrator
        .process_event(h.added(root, "needs-planning"))
        .await
        .unwrap();
    assert!(report.outcome.unwrap().is_success());
    h.record(root).await.proposal_issue.unwrap()
}

#[tokio::test]
async fn test_agent_parse_error_fails_once_and_reports() {
    let h = Harness::new();
    let root = h.git.seed_issue(42, "Export data", ROOT_BODY, &["needs-planning"]);
    h.agent.fail_next(AiError::Parse {
        reason: "missing field `summary`".into(),
    });

    let report = h
        .orchestrator
        .process_event(h.added(&root, "needs-planning"))
        .await
        .unwrap();

    let outcome = report.outcome.unwrap();
    assert_eq!(outcome.status, HandlerStatus::Failed);
    assert_eq!(outcome.error.unwrap().class, ErrorClass::AgentGeneration);
    assert!(outcome.labels_to_add.is_empty());

    let comments = h.git.comments_on(&root);
    assert_eq!(comments.len(), 1);
    assert!(comments[0].contains("agent_generation"));
    assert!(h.git.issues_titled("[PROPOSAL]").is_empty());
    assert!(h.git.issue(&root).has_label("needs-planning"));

    let record = h.record(&root).await;
    assert_eq!(record.stage, Stage::Failed);
    assert_eq!(record.failed_at_stage, Some(Stage::New));
    assert!(record.last_error.is_some());

    // The same delivery again changes nothing
    let replay = h
        .orchestrator
        .process_event(h.added(&root, "needs-planning"))
        .await
        .unwrap();
    assert_eq!(replay.disposition, Disposition::Duplicate);
    assert_eq!(h.git.comments_on(&root).len(), 1);
}

#[tokio::test]
async fn test_reapplying_label_recovers_failed_record() {
    let h = Harness::new();
    let root = h.git.seed_issue(42, "Export data", ROOT_BODY, &["needs-planning"]);
    h.agent.fail_next(AiError::Parse {
        reason: "not json".into(),
    });
    h.orchestrator
        .process_event(h.added(&root, "needs-planning"))
        .await
        .unwrap();

    h.orchestrator
        .process_event(h.removed(&root, "needs-planning"))
        .await
        .unwrap();
    let report = h
        .orchestrator
        .process_event(h.added(&root, "needs-planning"))
        .await
        .unwrap();

    assert!(report.outcome.unwrap().is_success());
    let record = h.record(&root).await;
    assert_eq!(record.stage, Stage::PlanProposed);
    assert!(record.last_error.is_none());
    assert!(record.failed_at_stage.is_none());
    assert_eq!(h.git.issues_titled("[PROPOSAL]").len(), 1);
}

#[tokio::test]
async fn test_transient_agent_error_is_retryable() {
    let h = Harness::new();
    let root = h.git.seed_issue(42, "Export data", ROOT_BODY, &[]);
    for _ in 0..2 {
        h.agent.fail_next(AiError::Api {
            provider: "fake",
            status: 503,
            message: "overloaded".into(),
        });
    }

    let report = h
        .orchestrator
        .process_event(h.added(&root, "needs-planning"))
        .await
        .unwrap();

    let outcome = report.outcome.unwrap();
    assert_eq!(outcome.status, HandlerStatus::RetryableFailed);
    assert_eq!(outcome.error.unwrap().class, ErrorClass::Transient);
    assert_eq!(h.agent.calls(), 2);
    let comments = h.git.comments_on(&root);
    assert_eq!(comments.len(), 1);
    assert!(comments[0].contains("temporary"));

    // Not remembered, so redelivery runs the handler
    let retry = h
        .orchestrator
        .process_event(h.added(&root, "needs-planning"))
        .await
        .unwrap();
    assert_eq!(retry.disposition, Disposition::Processed);
    assert!(retry.outcome.unwrap().is_success());
    assert_eq!(h.git.issues_titled("[PROPOSAL]").len(), 1);
    assert_eq!(h.record(&root).await.stage, Stage::PlanProposed);
}

#[tokio::test]
async fn test_missing_agent_is_configuration_error_without_comment() {
    let h = Harness::build(Setup {
        with_agent: false,
        ..Setup::default()
    });
    let root = h.git.seed_issue(42, "Export data", ROOT_BODY, &[]);

    let report = h
        .orchestrator
        .process_event(h.added(&root, "needs-planning"))
        .await
        .unwrap();

    let outcome = report.outcome.unwrap();
    assert_eq!(outcome.status, HandlerStatus::Failed);
    assert_eq!(outcome.error.unwrap().class, ErrorClass::Configuration);
    assert!(h.git.comments_on(&root).is_empty());
    assert_eq!(h.record(&root).await.stage, Stage::Failed);
}

#[tokio::test]
async fn test_permission_error_fails_without_retry() {
    let h = Harness::new();
    let root = h.git.seed_issue(42, "Export data", ROOT_BODY, &[]);
    h.git.fail_next(
        "create_issue",
        ScmError::Permission {
            status: 403,
            message: "Resource not accessible by integration".into(),
        },
    );

    let report = h
        .orchestrator
        .process_event(h.added(&root, "needs-planning"))
        .await
        .unwrap();

    let outcome = report.outcome.unwrap();
    assert_eq!(outcome.status, HandlerStatus::Failed);
    assert_eq!(outcome.error.unwrap().class, ErrorClass::Permission);
    assert!(h.git.issues_titled("[PROPOSAL]").is_empty());
    let comments = h.git.comments_on(&root);
    assert_eq!(comments.len(), 1);
    assert!(comments[0].contains("Re-apply the label"));
}

#[tokio::test]
async fn test_missing_issue_is_not_found() {
    let h = Harness::new();
    let ghost = IssueId::new("999");

    let report = h
        .orchestrator
        .process_event(h.added(&ghost, "needs-planning"))
        .await
        .unwrap();

    let outcome = report.outcome.unwrap();
    assert_eq!(outcome.status, HandlerStatus::Failed);
    assert_eq!(outcome.error.unwrap().class, ErrorClass::NotFound);
    assert_eq!(h.agent.calls(), 0);
    assert!(h.git.issues_titled("[PROPOSAL]").is_empty());
}

#[tokio::test]
async fn test_label_failure_keeps_work_and_retries_labels() {
    let h = Harness::new();
    let root = h.git.seed_issue(42, "Export data", ROOT_BODY, &["needs-planning"]);
    for _ in 0..6 {
        h.git.fail_next("set_labels", transient());
    }

    let report = h
        .orchestrator
        .process_event(h.added(&root, "needs-planning"))
        .await
        .unwrap();

    let outcome = report.outcome.unwrap();
    assert_eq!(outcome.status, HandlerStatus::RetryableFailed);
    assert!(h.git.issue(&root).has_label("needs-planning"));
    // The proposal itself is persisted
    assert_eq!(h.record(&root).await.stage, Stage::PlanProposed);

    let retry = h
        .orchestrator
        .process_event(h.added(&root, "needs-planning"))
        .await
        .unwrap();

    let outcome = retry.outcome.unwrap();
    assert!(outcome.is_success());
    assert!(outcome.skipped.is_some());
    let labels = h.git.issue(&root).labels;
    assert!(labels.contains(&"plan-ready".to_string()));
    assert!(!labels.contains(&"needs-planning".to_string()));
    assert_eq!(h.git.issues_titled("[PROPOSAL]").len(), 1);
    // Announcement plus the failure report
    assert_eq!(h.git.comments_on(&root).len(), 2);
}

#[tokio::test]
async fn test_approval_resumes_after_partial_task_creation() {
    let h = Harness::new();
    let root = h.git.seed_issue(42, "Export data", ROOT_BODY, &[]);
    let proposal = proposal_for(&h, &root).await;

    h.git.pass_next("create_issue");
    for _ in 0..4 {
        h.git.fail_next("create_issue", transient());
    }
    let report = h
        .orchestrator
        .process_event(h.added(&proposal, "approved"))
        .await
        .unwrap();

    assert_eq!(report.outcome.unwrap().status, HandlerStatus::RetryableFailed);
    let record = h.record(&root).await;
    assert_eq!(record.planned_tasks.len(), 3);
    assert_eq!(record.task_issues.len(), 1);
    assert_eq!(record.stage, Stage::PlanProposed);

    let retry = h
        .orchestrator
        .process_event(h.added(&proposal, "approved"))
        .await
        .unwrap();

    assert!(retry.outcome.unwrap().is_success());
    let tasks = h.git.issues_titled("[TASK");
    assert_eq!(tasks.len(), 3);
    assert_eq!(
        tasks.iter().filter(|t| t.title.starts_with("[TASK 1/3]")).count(),
        1
    );
    assert!(tasks[1].title.starts_with("[TASK 2/3]"));
    // Plan plus a single breakdown
    assert_eq!(h.agent.calls(), 2);
    assert_eq!(h.record(&root).await.stage, Stage::TasksCreated);
}

#[tokio::test]
async fn test_execute_resumes_without_duplicating_commits() {
    let h = Harness::new();
    let root = h.git.seed_issue(42, "Export data", ROOT_BODY, &[]);
    let proposal = proposal_for(&h, &root).await;
    h.orchestrator
        .process_event(h.added(&proposal, "approved"))
        .await
        .unwrap();
    let task = h.record(&root).await.task_issues[0].clone();

    h.git.fail_next(
        "open_change_request",
        ScmError::Rejected {
            status: 422,
            message: "Validation Failed".into(),
        },
    );
    let report = h
        .orchestrator
        .process_event(h.added(&task, "execute"))
        .await
        .unwrap();

    assert_eq!(report.outcome.unwrap().status, HandlerStatus::Failed);
    let record = h.record(&root).await;
    assert_eq!(record.stage, Stage::Failed);
    assert_eq!(record.failed_at_stage, Some(Stage::Executing));
    assert!(record.task_run(&task).unwrap().committed);

    h.orchestrator
        .process_event(h.removed(&task, "execute"))
        .await
        .unwrap();
    let retry = h
        .orchestrator
        .process_event(h.added(&task, "execute"))
        .await
        .unwrap();

    assert!(retry.outcome.unwrap().is_success());
    assert_eq!(h.git.branch_count(), 1);
    assert_eq!(h.git.state.lock().unwrap().commits.len(), 1);
    assert_eq!(h.git.change_requests().len(), 1);
    assert_eq!(h.record(&root).await.stage, Stage::InReview);
}

#[tokio::test]
async fn test_existing_branch_is_reused() {
    let h = Harness::new();
    let root = h.git.seed_issue(42, "Export data", ROOT_BODY, &[]);
    let proposal = proposal_for(&h, &root).await;
    h.orchestrator
        .process_event(h.added(&proposal, "approved"))
        .await
        .unwrap();
    let task = h.record(&root).await.task_issues[0].clone();
    h.git
        .state
        .lock()
        .unwrap()
        .branches
        .push(format!("labelflow/task-{task}"));

    let report = h
        .orchestrator
        .process_event(h.added(&task, "execute"))
        .await
        .unwrap();

    assert!(report.outcome.unwrap().is_success());
    assert_eq!(h.git.branch_count(), 1);
    assert_eq!(h.git.change_requests().len(), 1);
}

#[tokio::test]
async fn test_failed_record_persisted_under_root_key() {
    let h = Harness::new();
    let root = h.git.seed_issue(42, "Export data", ROOT_BODY, &[]);
    h.agent.fail_next(AiError::Parse {
        reason: "truncated".into(),
    });
    h.orchestrator
        .process_event(h.added(&root, "needs-planning"))
        .await
        .unwrap();

    let key = RecordKey::new(common::repo(), root.clone());
    let stored = h.store.load(&key).await.unwrap().unwrap();
    assert_eq!(stored.stage, Stage::Failed);
    assert_eq!(stored.seen_fingerprints.len(), 1);
}

#[tokio::test]
async fn test_permanent_label_failure_fails_record_once() {
    let h = Harness::new();
    let root = h.git.seed_issue(42, "Export data", ROOT_BODY, &["needs-planning"]);
    h.git.fail_next(
        "set_labels",
        ScmError::Permission {
            status: 403,
            message: "labels are read-only".into(),
        },
    );

    let report = h
        .orchestrator
        .process_event(h.added(&root, "needs-planning"))
        .await
        .unwrap();

    let outcome = report.outcome.unwrap();
    assert_eq!(outcome.status, HandlerStatus::Failed);
    assert_eq!(outcome.error.unwrap().class, ErrorClass::Permission);
    let record = h.record(&root).await;
    assert_eq!(record.stage, Stage::Failed);
    assert_eq!(record.failed_at_stage, Some(Stage::PlanProposed));
    assert!(record.proposal_issue.is_some());
    // Announcement plus the failure report
    assert_eq!(h.git.comments_on(&root).len(), 2);

    let replay = h
        .orchestrator
        .process_event(h.added(&root, "needs-planning"))
        .await
        .unwrap();
    assert_eq!(replay.disposition, Disposition::Duplicate);
    assert_eq!(h.git.comments_on(&root).len(), 2);
    assert_eq!(h.git.issues_titled("[PROPOSAL]").len(), 1);
}

fn flaky_harness() -> (Harness, Arc<FlakyStore>) {
    let store = Arc::new(FlakyStore::default());
    let h = Harness::build(Setup {
        store: store.clone(),
        ..Setup::default()
    });
    (h, store)
}

#[tokio::test]
async fn test_store_failure_after_handler_is_reported() {
    let (h, store) = flaky_harness();
    let root = h.git.seed_issue(42, "Export data", ROOT_BODY, &["needs-planning"]);
    // The proposal checkpoint lands, the save after the handler does not
    store.pass_next_save();
    store.fail_next_save(StoreFault::Io);

    let err = h
        .orchestrator
        .process_event(h.added(&root, "needs-planning"))
        .await
        .unwrap_err();

    assert_eq!(err.class(), ErrorClass::Transient);
    let comments = h.git.comments_on(&root);
    assert_eq!(comments.len(), 2);
    assert!(comments[1].contains("transient"));
    assert!(comments[1].contains("temporary"));
    // Labels were never touched
    assert!(h.git.issue(&root).has_label("needs-planning"));

    // Next delivery finishes the job on the checkpointed proposal
    let retry = h
        .orchestrator
        .process_event(h.added(&root, "needs-planning"))
        .await
        .unwrap();
    assert!(retry.outcome.unwrap().is_success());
    assert_eq!(h.git.issues_titled("[PROPOSAL]").len(), 1);
    assert_eq!(h.record(&root).await.stage, Stage::PlanProposed);
}

#[tokio::test]
async fn test_repeated_save_conflict_is_reported() {
    let (h, store) = flaky_harness();
    let root = h.git.seed_issue(42, "Export data", ROOT_BODY, &["needs-planning"]);
    store.pass_next_save();
    store.fail_next_save(StoreFault::Conflict);
    store.fail_next_save(StoreFault::Conflict);

    let err = h
        .orchestrator
        .process_event(h.added(&root, "needs-planning"))
        .await
        .unwrap_err();

    assert_eq!(err.class(), ErrorClass::StateConflict);
    let comments = h.git.comments_on(&root);
    assert_eq!(comments.len(), 2);
    assert!(comments[1].contains("state_conflict"));
}

#[tokio::test]
async fn test_store_failure_before_handler_is_reported() {
    let (h, store) = flaky_harness();
    let root = h.git.seed_issue(42, "Export data", ROOT_BODY, &["needs-planning"]);
    store.fail_next_load(StoreFault::Io);

    let err = h
        .orchestrator
        .process_event(h.added(&root, "needs-planning"))
        .await
        .unwrap_err();

    assert_eq!(err.class(), ErrorClass::Transient);
    assert_eq!(h.agent.calls(), 0);
    let comments = h.git.comments_on(&root);
    assert_eq!(comments.len(), 1);
    assert!(comments[0].contains("disk full"));
}
