//! Label-triggered workflow engine.
//!
//! Label events on issues drive a per-issue state machine:
//!
//! - `needs-planning` → [`handlers::ProposalHandler`] drafts a plan and opens
//!   a proposal issue
//! - `approved` → [`handlers::ApprovalHandler`] creates ordered task issues
//! - `execute` → [`handlers::TaskExecutionHandler`] commits a change on a task
//!   branch and opens a change request
//!
//! The [`WorkflowOrchestrator`] routes events, serializes work per record,
//! de-duplicates deliveries and persists [`WorkflowRecord`]s through a
//! [`StateStore`]. The [`Poller`] runs the same path continuously.

pub mod config;
pub mod error;
pub mod event;
pub mod handlers;
pub mod lock;
pub mod orchestrator;
pub mod poller;
pub mod record;
pub mod retry;
pub mod router;
pub mod store;
pub mod trigger;

pub use config::{AutomationSettings, ConfigError, LabelflowConfig};
pub use error::{ErrorClass, WorkflowError, WorkflowResult};
pub use event::{LabelAction, LabelEvent};
pub use handlers::{Artifact, HandlerOutcome, HandlerStatus, Services};
pub use orchestrator::{BatchReport, Disposition, EventReport, WorkflowOrchestrator};
pub use poller::{PollSummary, Poller};
pub use record::{RecordKey, Stage, TaskRun, WorkflowRecord};
pub use retry::{CallPolicies, RetryPolicy};
pub use router::LabelEventRouter;
pub use store::{FileStore, MemoryStore, StateStore, StoreError};
pub use trigger::{HandlerKind, LabelPattern, LabelTrigger};
