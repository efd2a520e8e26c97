//! Structured events emitted by the queue on every lifecycle change.
//!
//! Listeners subscribe through [`TaskQueue::subscribe`] to refresh a UI,
//! notify a user, or keep an audit trail.
//!
//! [`TaskQueue::subscribe`]: crate::queue::TaskQueue::subscribe

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{SkipReason, TaskId};

/// A structured event emitted by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

impl Event {
    /// The task this event is about, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        match &self.kind {
            EventKind::TaskAdded { id, .. }
            | EventKind::TaskCoalesced { id, .. }
            | EventKind::TaskRunning { id, .. }
            | EventKind::TaskSkipped { id, .. }
            | EventKind::TaskCompleted { id, .. }
            | EventKind::TaskDead { id, .. }
            | EventKind::ErrorRecorded { id, .. }
            | EventKind::ErrorResolved { id } => Some(*id),
            EventKind::AllTasksComplete | EventKind::Cleared => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    TaskAdded {
        id: TaskId,
        tag: String,
        group_id: Option<String>,
    },
    TaskCoalesced {
        id: TaskId,
        tag: String,
    },
    TaskRunning {
        id: TaskId,
        attempt: u32,
    },
    TaskSkipped {
        id: TaskId,
        reason: SkipReason,
    },
    TaskCompleted {
        id: TaskId,
        success: bool,
        /// Will run again on a later pass.
        rescheduled: bool,
    },
    TaskDead {
        id: TaskId,
        reason: String,
        attempts: u32,
    },
    ErrorRecorded {
        id: TaskId,
        message: Option<String>,
        error_id: Option<String>,
    },
    ErrorResolved {
        id: TaskId,
    },
    AllTasksComplete,
    Cleared,
}
