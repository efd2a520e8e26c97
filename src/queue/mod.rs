//! The task queue service. The public API for submitting and managing tasks.
//!
//! The queue owns the pending set, the recorded errors and the event
//! stream. All acceptance and state transitions go through here; the
//! store only ever sees them afterwards, through the writer thread.

mod writer;

use chrono::Utc;
use opentelemetry::KeyValue;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, broadcast};
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::model::*;
use crate::registry::TaskRegistry;
use crate::storage::{MemoryStore, SqliteStore, Store};
use crate::telemetry::metrics;

use writer::{StoreOp, StoreWriter};

/// Handle to a task queue. Clones share the same queue.
#[derive(Clone)]
pub struct TaskQueue {
    pub(crate) shared: Arc<Shared>,
}

pub(crate) struct Shared {
    state: Mutex<QueueState>,
    pub(crate) registry: TaskRegistry,
    pub(crate) config: QueueConfig,
    writer: StoreWriter,
    events: broadcast::Sender<Event>,
    /// Wakes the control plane after a submission or resolved error.
    pub(crate) wake: Notify,
    /// One runner pass at a time.
    pub(crate) run_lock: tokio::sync::Mutex<()>,
}

pub(crate) struct QueueState {
    /// Pending (non-terminal) tasks, in processing order.
    pub(crate) tasks: BTreeMap<TaskId, PendingTask>,
    pub(crate) dead: Vec<PendingTask>,
    pub(crate) errors: Vec<TaskError>,
    last_task_id: i64,
    last_error_id: i64,
    next_seq: u64,
    pub(crate) running: Option<TaskId>,
    /// Set when the running task is resubmitted; it runs once more.
    pub(crate) rerun_requested: bool,
}

impl TaskQueue {
    /// Open a queue over the given store, restoring whatever it holds.
    pub fn open(
        config: QueueConfig,
        registry: TaskRegistry,
        mut store: impl Store + 'static,
    ) -> Result<Self> {
        let snapshot = store.load()?;
        let writer = StoreWriter::spawn(Box::new(store), config.store_retry_attempts)?;
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        info!(
            pending = snapshot.tasks.len(),
            dead = snapshot.dead.len(),
            errors = snapshot.errors.len(),
            "task queue opened"
        );

        let state = QueueState {
            tasks: snapshot.tasks.into_iter().map(|t| (t.id, t)).collect(),
            dead: snapshot.dead,
            errors: snapshot.errors,
            last_task_id: snapshot.last_task_id,
            last_error_id: snapshot.last_error_id,
            next_seq: 1,
            running: None,
            rerun_requested: false,
        };

        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                registry,
                config,
                writer,
                events,
                wake: Notify::new(),
                run_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Create a queue without durability (for testing).
    pub fn in_memory(config: QueueConfig, registry: TaskRegistry) -> Result<Self> {
        Self::open(config, registry, MemoryStore::new())
    }

    /// Create a queue backed by a SQLite file.
    pub fn open_sqlite(
        path: impl AsRef<Path>,
        config: QueueConfig,
        registry: TaskRegistry,
    ) -> Result<Self> {
        Self::open(config, registry, SqliteStore::open(path)?)
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Submit a task. Returns as soon as the task is accepted.
    ///
    /// Acceptance is in-memory and serialized; persistence happens on the
    /// writer thread afterwards. Invalid tasks are rejected with
    /// [`Error::InvalidTask`] and leave the queue untouched.
    pub fn submit(&self, new: NewTask) -> Result<TaskHandle> {
        let tag = new.tag.clone();
        let result = self.accept(new);

        let label = match &result {
            Ok(handle) => acceptance_label(handle.acceptance),
            Err(_) => "invalid",
        };
        metrics::tasks_submitted().add(
            1,
            &[KeyValue::new("tag", tag), KeyValue::new("result", label)],
        );

        if let Ok(handle) = &result {
            let runnable = matches!(
                handle.acceptance,
                Acceptance::Queued | Acceptance::ErrorResolved
            );
            if runnable && self.shared.config.automatically_run_tasks {
                self.shared.wake.notify_one();
            }
        }

        result
    }

    fn accept(&self, new: NewTask) -> Result<TaskHandle> {
        self.validate(&new)?;

        let mut state = self.lock();

        // All tasks of a tag either belong to groups or none do.
        if let Some(similar) = state.tasks.values().find(|t| t.tag == new.tag) {
            match (similar.group_id.is_some(), new.group_id.is_some()) {
                (false, true) => {
                    return Err(Error::InvalidTask(format!(
                        "tasks tagged '{}' have no group_id, but this one does",
                        new.tag
                    )));
                }
                (true, false) => {
                    return Err(Error::InvalidTask(format!(
                        "tasks tagged '{}' have a group_id, but this one doesn't",
                        new.tag
                    )));
                }
                _ => {}
            }
        }

        if let Some(handle) = self.coalesce(&mut state, &new) {
            return Ok(handle);
        }

        let now = Utc::now();
        state.last_task_id += 1;
        let id = TaskId(state.last_task_id);
        let task = PendingTask {
            id,
            tag: new.tag,
            data_id: new.data_id,
            group_id: new.group_id,
            manually_run: new.manually_run,
            params: new.params,
            state: State::Queued,
            attempts: 0,
            created_at: now,
            updated_at: now,
        };

        state.tasks.insert(id, task.clone());
        self.emit(
            &mut state,
            EventKind::TaskAdded {
                id,
                tag: task.tag.clone(),
                group_id: task.group_id.clone(),
            },
        );
        debug!(%id, tag = %task.tag, "task added");
        self.shared.writer.send(StoreOp::InsertTask(task));

        Ok(TaskHandle {
            id,
            acceptance: Acceptance::Queued,
        })
    }

    fn validate(&self, new: &NewTask) -> Result<()> {
        if new.tag.trim().is_empty() {
            return Err(Error::InvalidTask("tag must not be blank".to_string()));
        }
        if new.group_id.as_deref().is_some_and(|g| g.trim().is_empty()) {
            return Err(Error::InvalidTask("group_id must not be blank".to_string()));
        }
        if new.data_id.as_deref().is_some_and(|d| d.trim().is_empty()) {
            return Err(Error::InvalidTask("data_id must not be blank".to_string()));
        }

        if let Some(reason) = &new.payload_error {
            return Err(Error::InvalidTask(format!(
                "{}: payload failed to serialize: {reason}",
                new.tag
            )));
        }

        let runner = self.shared.registry.get(&new.tag).ok_or_else(|| {
            Error::InvalidTask(format!("no runner registered for tag '{}'", new.tag))
        })?;
        runner
            .validate(&new.params)
            .map_err(|reason| Error::InvalidTask(format!("{}: {reason}", new.tag)))
    }

    /// Look for a pending task doing the same work. Only tasks with a
    /// `data_id` are ever coalesced.
    fn coalesce(&self, state: &mut QueueState, new: &NewTask) -> Option<TaskHandle> {
        let data_id = new.data_id.as_deref()?;

        let existing: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|t| {
                t.tag == new.tag
                    && t.data_id.as_deref() == Some(data_id)
                    && (new.group_id.is_none() || t.group_id == new.group_id)
            })
            .map(|t| t.id)
            .collect();
        let last = *existing.last()?;

        if state.running == Some(last) {
            state.rerun_requested = true;
            self.emit(
                state,
                EventKind::TaskCoalesced {
                    id: last,
                    tag: new.tag.clone(),
                },
            );
            debug!(id = %last, "task resubmitted while running, will rerun");
            return Some(TaskHandle {
                id: last,
                acceptance: Acceptance::RerunScheduled,
            });
        }

        if new.resolve_error_if_exists && state.errors.iter().any(|e| e.task_id == last) {
            for id in existing {
                self.resolve_locked(state, id);
            }
            return Some(TaskHandle {
                id: last,
                acceptance: Acceptance::ErrorResolved,
            });
        }

        let coalesced = match new.group_id.as_deref() {
            None => Some(last),
            // A grouped task only coalesces with the newest task of its
            // group; otherwise it must run again after the ones before it.
            Some(group) => state
                .tasks
                .values()
                .rev()
                .find(|t| t.group_id.as_deref() == Some(group))
                .filter(|t| t.tag == new.tag && t.data_id.as_deref() == Some(data_id))
                .map(|t| t.id),
        }?;

        self.emit(
            state,
            EventKind::TaskCoalesced {
                id: coalesced,
                tag: new.tag.clone(),
            },
        );
        debug!(id = %coalesced, "equivalent task already pending");
        Some(TaskHandle {
            id: coalesced,
            acceptance: Acceptance::Coalesced,
        })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// All pending tasks, in processing order.
    pub fn pending(&self) -> Vec<PendingTask> {
        self.lock().tasks.values().cloned().collect()
    }

    /// Get a pending task by id.
    pub fn get(&self, id: TaskId) -> Result<PendingTask> {
        self.lock()
            .tasks
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound(id))
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().tasks.is_empty()
    }

    /// Tasks that exhausted their attempts or had no runner.
    pub fn dead(&self) -> Vec<PendingTask> {
        self.lock().dead.clone()
    }

    /// A grouped task may only run when it is first in its group.
    pub fn is_task_able_to_manually_run(&self, id: TaskId) -> Result<bool> {
        let state = self.lock();
        let task = state.tasks.get(&id).ok_or(Error::NotFound(id))?;
        let Some(group) = task.group_id.as_deref() else {
            return Ok(true);
        };
        let first = state
            .tasks
            .values()
            .find(|t| t.group_id.as_deref() == Some(group))
            .map(|t| t.id);
        Ok(first == Some(id))
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.shared.registry
    }

    /// Do both handles point at the same queue?
    pub fn ptr_eq(&self, other: &TaskQueue) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    // -----------------------------------------------------------------------
    // Errors
    // -----------------------------------------------------------------------

    /// Record an error against a task. The runner skips the task until
    /// the error is resolved.
    pub fn record_error(
        &self,
        id: TaskId,
        message: Option<String>,
        error_id: Option<String>,
    ) -> Result<TaskError> {
        let mut state = self.lock();
        if !state.tasks.contains_key(&id) {
            return Err(Error::NotFound(id));
        }
        Ok(self.record_error_locked(&mut state, id, message, error_id))
    }

    /// Most recent unresolved error for a task.
    pub fn latest_error(&self, id: TaskId) -> Result<Option<TaskError>> {
        let state = self.lock();
        if !state.tasks.contains_key(&id) {
            return Err(Error::NotFound(id));
        }
        Ok(state.errors.iter().rev().find(|e| e.task_id == id).cloned())
    }

    /// Resolve a task's recorded errors. Returns false if there were none.
    pub fn resolve_error(&self, id: TaskId) -> Result<bool> {
        let resolved = {
            let mut state = self.lock();
            if !state.tasks.contains_key(&id) {
                return Err(Error::NotFound(id));
            }
            self.resolve_locked(&mut state, id)
        };
        if resolved && self.shared.config.automatically_run_tasks {
            self.shared.wake.notify_one();
        }
        Ok(resolved)
    }

    /// All unresolved errors, oldest first.
    pub fn errors(&self) -> Vec<TaskError> {
        self.lock().errors.clone()
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Drop every task and error. Ids keep increasing afterwards.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.lock();
        state.tasks.clear();
        state.dead.clear();
        state.errors.clear();
        state.running = None;
        state.rerun_requested = false;
        self.emit(&mut state, EventKind::Cleared);
        self.shared.writer.send(StoreOp::Clear);
        info!("task queue cleared");
        Ok(())
    }

    /// Subscribe to queue events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// Block until every change accepted so far has reached the store.
    pub fn flush(&self) -> Result<()> {
        self.shared.writer.flush()
    }

    // -----------------------------------------------------------------------
    // Internals shared with the runner engine
    // -----------------------------------------------------------------------

    pub(crate) fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn woken(&self) -> tokio::sync::futures::Notified<'_> {
        self.shared.wake.notified()
    }

    pub(crate) fn emit(&self, state: &mut QueueState, kind: EventKind) {
        let seq = state.next_seq;
        state.next_seq += 1;
        // No subscribers is fine.
        let _ = self.shared.events.send(Event {
            seq,
            timestamp: Utc::now(),
            kind,
        });
    }

    /// Move a task to a new state and persist it. Completed tasks leave
    /// the queue; dead ones move to the dead list.
    pub(crate) fn transition_locked(
        &self,
        state: &mut QueueState,
        id: TaskId,
        to: State,
    ) -> Result<PendingTask> {
        let task = state.tasks.get_mut(&id).ok_or(Error::NotFound(id))?;
        let from = task.state;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { from, to });
        }

        task.state = to;
        task.updated_at = Utc::now();
        if to == State::Running {
            task.attempts += 1;
        }
        let task = task.clone();

        match to {
            State::Completed => {
                state.tasks.remove(&id);
                // The store drops the task's errors with it.
                state.errors.retain(|e| e.task_id != id);
                self.shared.writer.send(StoreOp::DeleteTask(id));
            }
            State::Dead => {
                state.tasks.remove(&id);
                state.dead.push(task.clone());
                self.shared.writer.send(StoreOp::UpdateTask(task.clone()));
            }
            _ => self.shared.writer.send(StoreOp::UpdateTask(task.clone())),
        }

        metrics::task_state_transitions().add(
            1,
            &[
                KeyValue::new("from", from.to_string()),
                KeyValue::new("to", to.to_string()),
            ],
        );

        Ok(task)
    }

    pub(crate) fn record_error_locked(
        &self,
        state: &mut QueueState,
        id: TaskId,
        message: Option<String>,
        error_id: Option<String>,
    ) -> TaskError {
        state.last_error_id += 1;
        let error = TaskError {
            id: state.last_error_id,
            task_id: id,
            message,
            error_id,
            created_at: Utc::now(),
        };
        state.errors.push(error.clone());
        self.emit(
            state,
            EventKind::ErrorRecorded {
                id,
                message: error.message.clone(),
                error_id: error.error_id.clone(),
            },
        );
        warn!(%id, message = ?error.message, error_id = ?error.error_id, "error recorded");
        self.shared.writer.send(StoreOp::InsertError(error.clone()));
        error
    }

    fn resolve_locked(&self, state: &mut QueueState, id: TaskId) -> bool {
        let before = state.errors.len();
        state.errors.retain(|e| e.task_id != id);
        if state.errors.len() == before {
            return false;
        }
        self.emit(state, EventKind::ErrorResolved { id });
        info!(%id, "recorded error resolved");
        self.shared.writer.send(StoreOp::DeleteErrors(id));
        true
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("config", &self.shared.config)
            .field("registry", &self.shared.registry)
            .finish_non_exhaustive()
    }
}

fn acceptance_label(acceptance: Acceptance) -> &'static str {
    match acceptance {
        Acceptance::Queued => "queued",
        Acceptance::Coalesced => "coalesced",
        Acceptance::RerunScheduled => "rerun",
        Acceptance::ErrorResolved => "error_resolved",
    }
}
