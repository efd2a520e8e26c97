//! UI-facing trigger: one activation, one submitted task.

use std::fmt;
use tracing::{info, warn};

use crate::error::Result;
use crate::model::{NewTask, TaskHandle};
use crate::queue::TaskQueue;
use crate::shared;

enum Target {
    Queue(TaskQueue),
    Shared,
}

/// A command object bound to a user action, such as a button.
///
/// Each [`activate`](Trigger::activate) builds a fresh task and submits it
/// once. Failures are logged and returned, never raised as panics.
///
/// ```no_run
/// use pending_tasks::model::NewTask;
/// use pending_tasks::trigger::Trigger;
///
/// let trigger = Trigger::shared(|| NewTask::new("foo"));
/// let _ = trigger.activate();
/// ```
pub struct Trigger {
    target: Target,
    make_task: Box<dyn Fn() -> NewTask + Send + Sync>,
}

impl Trigger {
    /// Submit to an explicit queue.
    pub fn new(queue: TaskQueue, make_task: impl Fn() -> NewTask + Send + Sync + 'static) -> Self {
        Self {
            target: Target::Queue(queue),
            make_task: Box::new(make_task),
        }
    }

    /// Submit to the process-wide queue, resolved on every activation.
    pub fn shared(make_task: impl Fn() -> NewTask + Send + Sync + 'static) -> Self {
        Self {
            target: Target::Shared,
            make_task: Box::new(make_task),
        }
    }

    pub fn activate(&self) -> Result<TaskHandle> {
        let new = (self.make_task)();
        let tag = new.tag().to_string();

        let result = match &self.target {
            Target::Queue(queue) => queue.submit(new),
            Target::Shared => shared::submit(new),
        };

        match &result {
            Ok(handle) => {
                info!(id = %handle.id, %tag, acceptance = ?handle.acceptance, "trigger submitted task")
            }
            Err(e) => warn!(%tag, error = %e, "trigger failed to submit task"),
        }
        result
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match self.target {
            Target::Queue(_) => "queue",
            Target::Shared => "shared",
        };
        f.debug_struct("Trigger")
            .field("target", &target)
            .finish_non_exhaustive()
    }
}
