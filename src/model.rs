//! Core data model.
//!
//! A pending task is one unit of deferred work. The caller builds a
//! [`NewTask`], hands it to the queue, and gets back a [`TaskHandle`].
//! From then on the queue owns the task: its identity, its place in line
//! and its lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Task identifier, assigned by the queue at acceptance.
///
/// Strictly increasing for the life of a store and never reused, so
/// ordering by id is ordering by submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub i64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse()
            .map(TaskId)
            .map_err(|_| Error::Other(format!("invalid task id: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Pending Task
// ---------------------------------------------------------------------------

/// A task accepted by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTask {
    pub id: TaskId,

    /// Kind discriminator. Selects the runner.
    pub tag: String,

    /// Identifies the data this task works on. Tasks with the same
    /// (tag, data_id) are coalesced on submission.
    pub data_id: Option<String>,

    /// Tasks sharing a group run strictly in order; a failure blocks the
    /// rest of the group for the current pass.
    pub group_id: Option<String>,

    /// Never picked by the automatic runner, only by an explicit run.
    pub manually_run: bool,

    /// Payload for the runner. The queue doesn't interpret it.
    pub params: serde_json::Value,

    pub state: State,

    /// Number of times a runner has started on this task.
    pub attempts: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of an accepted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Waiting for the runner.
    Queued,
    /// A runner is executing it.
    Running,
    /// Last run failed. Retried on a later pass.
    Failed,
    /// Ran successfully. Terminal.
    Completed,
    /// Exhausted retries or has no runner. Terminal.
    Dead,
}

impl State {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (Queued, Running)
                | (Queued, Dead)      // no runner for the tag
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Queued)   // resubmitted while running: rerun
                | (Failed, Running)   // retry
                | (Failed, Dead) // exhausted retries
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Completed | State::Dead)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Queued => "queued",
            State::Running => "running",
            State::Failed => "failed",
            State::Completed => "completed",
            State::Dead => "dead",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(State::Queued),
            "running" => Ok(State::Running),
            "failed" => Ok(State::Failed),
            "completed" => Ok(State::Completed),
            "dead" => Ok(State::Dead),
            _ => Err(Error::Other(format!("unknown state: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Task kinds
// ---------------------------------------------------------------------------

/// A typed task kind. The tag is the runtime discriminator; the value
/// itself is the payload.
///
/// A marker kind with no fields serializes to `null`:
///
/// ```
/// use pending_tasks::model::{NewTask, TaskKind};
///
/// #[derive(serde::Serialize)]
/// struct Refresh;
///
/// impl TaskKind for Refresh {
///     const TAG: &'static str = "refresh";
/// }
///
/// let new = NewTask::of(&Refresh);
/// assert_eq!(new.tag(), "refresh");
/// ```
pub trait TaskKind: Serialize {
    const TAG: &'static str;
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// What a runner reports after executing a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    /// Done. The task leaves the queue.
    Successful,
    /// Failed. The task is retried on a later pass. A report records an
    /// error on the task, which blocks it until resolved.
    Failed { report: Option<ErrorReport> },
}

impl TaskResult {
    pub fn failed() -> Self {
        TaskResult::Failed { report: None }
    }

    pub fn failed_with(message: impl Into<String>, error_id: Option<String>) -> Self {
        TaskResult::Failed {
            report: Some(ErrorReport {
                message: Some(message.into()),
                error_id,
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskResult::Successful)
    }
}

/// Error details a runner can attach to a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub message: Option<String>,
    pub error_id: Option<String>,
}

/// An error recorded against a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub id: i64,
    pub task_id: TaskId,
    /// Human readable message.
    pub message: Option<String>,
    /// Caller-defined error identifier.
    pub error_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Why the runner passed over a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The runner's `can_run` said no.
    NotReadyToRun,
    /// The task has a recorded error that hasn't been resolved.
    UnresolvedError,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SkipReason::NotReadyToRun => "not_ready_to_run",
            SkipReason::UnresolvedError => "unresolved_error",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// Returned on successful submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle {
    pub id: TaskId,
    pub acceptance: Acceptance,
}

/// How the queue accepted a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    /// New task appended to the queue.
    Queued,
    /// An equivalent task is already pending; its id is returned.
    Coalesced,
    /// The equivalent task is running right now and will run once more.
    RerunScheduled,
    /// The equivalent task had recorded errors, which are now resolved.
    ErrorResolved,
}

/// Builder for new tasks. The queue's public API for submitting work.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub(crate) tag: String,
    pub(crate) data_id: Option<String>,
    pub(crate) group_id: Option<String>,
    pub(crate) manually_run: bool,
    pub(crate) params: serde_json::Value,
    pub(crate) resolve_error_if_exists: bool,
    /// Set when a typed payload failed to serialize. Submission rejects it.
    pub(crate) payload_error: Option<String>,
}

impl NewTask {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            data_id: None,
            group_id: None,
            manually_run: false,
            params: serde_json::Value::Null,
            resolve_error_if_exists: true,
            payload_error: None,
        }
    }

    /// Build from a typed kind: its tag plus its serialized payload.
    /// A payload that fails to serialize is rejected at submission.
    pub fn of<K: TaskKind>(kind: &K) -> Self {
        match serde_json::to_value(kind) {
            Ok(params) => Self::new(K::TAG).params(params),
            Err(e) => Self {
                payload_error: Some(e.to_string()),
                ..Self::new(K::TAG)
            },
        }
    }

    pub fn data_id(mut self, data_id: impl Into<String>) -> Self {
        self.data_id = Some(data_id.into());
        self
    }

    pub fn group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn manually_run(mut self, manually_run: bool) -> Self {
        self.manually_run = manually_run;
        self
    }

    pub fn params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// When an equivalent task has recorded errors, resolve them instead of
    /// returning it untouched. Defaults to true.
    pub fn resolve_error_if_exists(mut self, resolve: bool) -> Self {
        self.resolve_error_if_exists = resolve;
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

// ---------------------------------------------------------------------------
// Running
// ---------------------------------------------------------------------------

/// Narrows a runner pass.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    /// Only run tasks of this group.
    pub group_id: Option<String>,
}

impl RunFilter {
    pub fn group(group_id: impl Into<String>) -> Self {
        Self {
            group_id: Some(group_id.into()),
        }
    }
}

/// Counts from one runner pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub ran: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// What happened to one task when the runner reached it.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    /// Failed and stays in the queue for a later pass.
    Failed,
    /// Failed for the last time.
    Dead,
    Skipped(SkipReason),
    /// No runner registered for the tag.
    Unroutable,
    /// Cleared from the queue while it was running.
    Discarded,
}
