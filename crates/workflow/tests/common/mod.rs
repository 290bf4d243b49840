//! In-memory git host and agent shared by the scenario tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ai::{AIMessage, AIResponse, Agent, AgentProvider, AiError, AiResult, GenerateOptions, TokenUsage};
use async_trait::async_trait;
use scm::{
    Backend, ChangeRequest, ChangeRequestFilter, ChangeRequestId, ChangeRequestState, CommentId,
    FileChange, GitProvider, Issue, IssueFilter, IssueId, IssueState, NewChangeRequest, NewIssue,
    RepoRef, ScmError, ScmResult,
};
use workflow::{
    config::default_triggers, AutomationSettings, CallPolicies, LabelEvent, LabelTrigger,
    MemoryStore, RecordKey, RetryPolicy, Services, StateStore, StoreError, WorkflowOrchestrator,
    WorkflowRecord,
};

pub fn repo() -> RepoRef {
    RepoRef::new("acme", "widgets")
}

#[derive(Debug, Default)]
pub struct GitState {
    pub issues: BTreeMap<u64, Issue>,
    pub next_id: u64,
    pub comments: Vec<(IssueId, String)>,
    pub branches: Vec<String>,
    pub commits: Vec<(String, String, Vec<FileChange>)>,
    pub change_requests: Vec<ChangeRequest>,
    pub label_calls: u32,
    failures: HashMap<&'static str, VecDeque<Option<ScmError>>>,
}

/// Git host that keeps everything in memory. Operations can be made to fail
/// with [`FakeGit::fail_next`].
#[derive(Debug, Clone)]
pub struct FakeGit {
    backend: Backend,
    pub state: Arc<Mutex<GitState>>,
    delay: Duration,
}

impl FakeGit {
    pub fn new(backend: Backend) -> Self {
        let state = GitState {
            next_id: 100,
            ..GitState::default()
        };
        Self {
            backend,
            state: Arc::new(Mutex::new(state)),
            delay: Duration::ZERO,
        }
    }

    /// Sleep this long inside every mutating call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn seed_issue(&self, id: u64, title: &str, body: &str, labels: &[&str]) -> IssueId {
        let issue = Issue {
            id: IssueId::new(id.to_string()),
            title: title.to_string(),
            body: body.to_string(),
            labels: labels.iter().map(ToString::to_string).collect(),
            state: IssueState::Open,
            url: None,
        };
        let mut state = self.state.lock().unwrap();
        state.issues.insert(id, issue);
        state.next_id = state.next_id.max(id + 1);
        IssueId::new(id.to_string())
    }

    pub fn fail_next(&self, operation: &'static str, err: ScmError) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(operation)
            .or_default()
            .push_back(Some(err));
    }

    /// Let the next call through; queue it before a `fail_next` to fail a
    /// later call.
    pub fn pass_next(&self, operation: &'static str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(operation)
            .or_default()
            .push_back(None);
    }

    /// A human puts `label` on the issue.
    pub fn add_label(&self, id: &IssueId, label: &str) {
        let number: u64 = id.as_str().parse().unwrap();
        let mut state = self.state.lock().unwrap();
        let issue = state.issues.get_mut(&number).unwrap();
        if !issue.has_label(label) {
            issue.labels.push(label.to_string());
        }
    }

    pub fn issue(&self, id: &IssueId) -> Issue {
        let key: u64 = id.as_str().parse().unwrap();
        self.state.lock().unwrap().issues[&key].clone()
    }

    pub fn issues_titled(&self, prefix: &str) -> Vec<Issue> {
        self.state
            .lock()
            .unwrap()
            .issues
            .values()
            .filter(|i| i.title.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn comments_on(&self, id: &IssueId) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .comments
            .iter()
            .filter(|(issue, _)| issue == id)
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub fn branch_count(&self) -> usize {
        self.state.lock().unwrap().branches.len()
    }

    pub fn change_requests(&self) -> Vec<ChangeRequest> {
        self.state.lock().unwrap().change_requests.clone()
    }

    pub fn merge_all(&self) {
        for cr in &mut self.state.lock().unwrap().change_requests {
            cr.state = ChangeRequestState::Merged;
        }
    }

    fn take_failure(&self, operation: &'static str) -> ScmResult<()> {
        let mut state = self.state.lock().unwrap();
        match state.failures.get_mut(operation).and_then(VecDeque::pop_front) {
            Some(Some(err)) => Err(err),
            _ => Ok(()),
        }
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl GitProvider for FakeGit {
    fn backend(&self) -> Backend {
        self.backend
    }

    fn change_request_reference(&self, id: &ChangeRequestId) -> String {
        match self.backend {
            Backend::GitLab => format!("!{id}"),
            Backend::GitHub | Backend::Gitea => format!("#{id}"),
        }
    }

    async fn get_issue(&self, id: &IssueId) -> ScmResult<Issue> {
        self.take_failure("get_issue")?;
        let key: u64 = id
            .as_str()
            .parse()
            .map_err(|_| ScmError::NotFound(format!("issue {id}")))?;
        self.state
            .lock()
            .unwrap()
            .issues
            .get(&key)
            .cloned()
            .ok_or_else(|| ScmError::NotFound(format!("issue {id}")))
    }

    async fn list_issues(&self, filter: &IssueFilter) -> ScmResult<Vec<Issue>> {
        self.take_failure("list_issues")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .issues
            .values()
            .filter(|i| i.state == filter.state.unwrap_or(IssueState::Open))
            .filter(|i| filter.labels.iter().all(|l| i.has_label(l)))
            .cloned()
            .collect())
    }

    async fn add_comment(&self, id: &IssueId, body: &str) -> ScmResult<CommentId> {
        self.take_failure("add_comment")?;
        let mut state = self.state.lock().unwrap();
        state.comments.push((id.clone(), body.to_string()));
        Ok(CommentId::new(state.comments.len().to_string()))
    }

    async fn set_labels(&self, id: &IssueId, add: &[String], remove: &[String]) -> ScmResult<()> {
        self.take_failure("set_labels")?;
        let key: u64 = id.as_str().parse().unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        state.label_calls += 1;
        let issue = state
            .issues
            .get_mut(&key)
            .ok_or_else(|| ScmError::NotFound(format!("issue {id}")))?;
        for label in add {
            if !issue.has_label(label) {
                issue.labels.push(label.clone());
            }
        }
        issue.labels.retain(|l| !remove.contains(l));
        Ok(())
    }

    async fn create_issue(&self, new: &NewIssue) -> ScmResult<IssueId> {
        self.pause().await;
        self.take_failure("create_issue")?;
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.issues.insert(
            id,
            Issue {
                id: IssueId::new(id.to_string()),
                title: new.title.clone(),
                body: new.body.clone(),
                labels: new.labels.clone(),
                state: IssueState::Open,
                url: None,
            },
        );
        Ok(IssueId::new(id.to_string()))
    }

    async fn create_branch(&self, _from_ref: &str, name: &str) -> ScmResult<()> {
        self.pause().await;
        self.take_failure("create_branch")?;
        let mut state = self.state.lock().unwrap();
        if state.branches.iter().any(|b| b == name) {
            return Err(ScmError::Conflict(format!("branch {name} exists")));
        }
        state.branches.push(name.to_string());
        Ok(())
    }

    async fn commit_changes(&self, branch: &str, message: &str, files: &[FileChange]) -> ScmResult<()> {
        self.take_failure("commit_changes")?;
        let mut state = self.state.lock().unwrap();
        if !state.branches.iter().any(|b| b == branch) {
            return Err(ScmError::NotFound(format!("branch {branch}")));
        }
        state
            .commits
            .push((branch.to_string(), message.to_string(), files.to_vec()));
        Ok(())
    }

    async fn open_change_request(&self, request: &NewChangeRequest) -> ScmResult<ChangeRequestId> {
        self.take_failure("open_change_request")?;
        let mut state = self.state.lock().unwrap();
        let id = ChangeRequestId::new((state.change_requests.len() + 1).to_string());
        state.change_requests.push(ChangeRequest {
            id: id.clone(),
            source_branch: request.source_branch.clone(),
            target_branch: request.target_branch.clone(),
            state: ChangeRequestState::Open,
            url: None,
        });
        Ok(id)
    }

    async fn list_change_requests(&self, filter: &ChangeRequestFilter) -> ScmResult<Vec<ChangeRequest>> {
        self.take_failure("list_change_requests")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .change_requests
            .iter()
            .filter(|cr| filter.matches(cr))
            .cloned()
            .collect())
    }
}

/// Agent that answers each schema with canned JSON.
#[derive(Debug)]
pub struct FakeAgent {
    pub task_count: usize,
    pub calls: AtomicU32,
    failures: Mutex<VecDeque<AiError>>,
}

impl FakeAgent {
    pub fn new(task_count: usize) -> Self {
        Self {
            task_count,
            calls: AtomicU32::new(0),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    pub fn fail_next(&self, err: AiError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentProvider for FakeAgent {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn is_configured(&self) -> bool {
        true
    }

    fn default_model(&self) -> &'static str {
        "fake-model"
    }

    async fn generate_text(
        &self,
        model: &str,
        _messages: &[AIMessage],
        options: &GenerateOptions,
    ) -> AiResult<AIResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let text = match options.schema_name.as_deref() {
            Some("plan") => serde_json::json!({
                "summary": "Add CSV export",
                "plan": "Write an exporter and expose it on the CLI.",
            }),
            Some("breakdown") => {
                let tasks: Vec<_> = (1..=self.task_count)
                    .map(|i| serde_json::json!({"title": format!("Step {i}"), "description": format!("Do step {i}.")}))
                    .collect();
                serde_json::json!({ "tasks": tasks })
            }
            Some("change") => serde_json::json!({
                "summary": "Implement the step",
                "commit_message": "Implement the step",
                "files": [{"path": "src/export.rs", "content": "pub fn export() {}\n"}],
            }),
            other => panic!("unexpected schema {other:?}"),
        };

        Ok(AIResponse {
            text: text.to_string(),
            usage: TokenUsage::default(),
            model: model.to_string(),
            provider: "fake".to_string(),
        })
    }
}

/// Policies without real waiting.
pub fn fast_policies() -> CallPolicies {
    let quick = |attempts| RetryPolicy {
        max_attempts: attempts,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        backoff_multiplier: 2.0,
    };
    CallPolicies {
        labels: quick(6),
        git: quick(4),
        agent: quick(2),
        git_timeout: Duration::from_secs(5),
        agent_timeout: Duration::from_secs(5),
    }
}

#[derive(Debug, Clone, Copy)]
pub enum StoreFault {
    Io,
    Conflict,
}

impl StoreFault {
    fn error(self, record_key: String) -> StoreError {
        match self {
            Self::Io => StoreError::Io {
                path: record_key,
                source: std::io::Error::other("disk full"),
            },
            Self::Conflict => StoreError::Conflict {
                key: record_key,
                expected: 1,
                found: 2,
            },
        }
    }
}

/// [`MemoryStore`] whose saves and loads can be made to fail, queued the
/// same way as [`FakeGit::fail_next`].
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    saves: Mutex<VecDeque<Option<StoreFault>>>,
    loads: Mutex<VecDeque<StoreFault>>,
}

impl FlakyStore {
    pub fn pass_next_save(&self) {
        self.saves.lock().unwrap().push_back(None);
    }

    pub fn fail_next_save(&self, fault: StoreFault) {
        self.saves.lock().unwrap().push_back(Some(fault));
    }

    /// Fail the next `load` or `find_by_issue`.
    pub fn fail_next_load(&self, fault: StoreFault) {
        self.loads.lock().unwrap().push_back(fault);
    }

    fn load_fault(&self, what: String) -> Result<(), StoreError> {
        match self.loads.lock().unwrap().pop_front() {
            Some(fault) => Err(fault.error(what)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StateStore for FlakyStore {
    fn storage_type(&self) -> &'static str {
        "flaky"
    }

    async fn load(&self, key: &RecordKey) -> Result<Option<WorkflowRecord>, StoreError> {
        self.load_fault(key.to_string())?;
        self.inner.load(key).await
    }

    async fn find_by_issue(
        &self,
        repository: &RepoRef,
        issue: &IssueId,
    ) -> Result<Option<WorkflowRecord>, StoreError> {
        self.load_fault(format!("{repository}#{issue}"))?;
        self.inner.find_by_issue(repository, issue).await
    }

    async fn save(&self, record: &mut WorkflowRecord) -> Result<(), StoreError> {
        let fault = self.saves.lock().unwrap().pop_front().flatten();
        match fault {
            Some(fault) => Err(fault.error(record.key().to_string())),
            None => self.inner.save(record).await,
        }
    }

    async fn list(&self, repository: &RepoRef) -> Result<Vec<WorkflowRecord>, StoreError> {
        self.inner.list(repository).await
    }
}

pub struct Harness {
    pub git: FakeGit,
    pub agent: Arc<FakeAgent>,
    pub store: Arc<dyn StateStore>,
    pub orchestrator: Arc<WorkflowOrchestrator>,
}

/// Knobs for [`Harness::build`].
pub struct Setup {
    pub git: FakeGit,
    pub triggers: Vec<LabelTrigger>,
    pub task_count: usize,
    pub with_agent: bool,
    pub store: Arc<dyn StateStore>,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            git: FakeGit::new(Backend::GitHub),
            triggers: default_triggers(),
            task_count: 3,
            with_agent: true,
            store: Arc::new(MemoryStore::new()),
        }
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::build(Setup::default())
    }

    pub fn build(setup: Setup) -> Self {
        let Setup {
            git,
            triggers,
            task_count,
            with_agent,
            store,
        } = setup;
        let agent = Arc::new(FakeAgent::new(task_count));
        let services = Services {
            git: Arc::new(git.clone()),
            agent: with_agent.then(|| Agent::new(agent.clone(), None)),
            store: Arc::clone(&store),
            settings: AutomationSettings::for_repository(repo(), "main"),
            policies: fast_policies(),
        };
        let orchestrator = Arc::new(WorkflowOrchestrator::new(services, triggers));
        Self {
            git,
            agent,
            store,
            orchestrator,
        }
    }

    pub fn added(&self, issue: &IssueId, label: &str) -> LabelEvent {
        LabelEvent::added(self.git.backend(), repo(), issue.clone(), label)
    }

    pub fn removed(&self, issue: &IssueId, label: &str) -> LabelEvent {
        LabelEvent::removed(self.git.backend(), repo(), issue.clone(), label)
    }

    /// Stored record rooted at `root`.
    pub async fn record(&self, root: &IssueId) -> WorkflowRecord {
        self.store
            .load(&RecordKey::new(repo(), root.clone()))
            .await
            .unwrap()
            .expect("record exists")
    }
}

/// Default triggers with AI switched off.
pub fn triggers_without_ai() -> Vec<LabelTrigger> {
    default_triggers()
        .into_iter()
        .map(|t| LabelTrigger {
            ai_enabled: false,
            ..t
        })
        .collect()
}
