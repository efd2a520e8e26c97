//! Process-wide queue instance.
//!
//! Code that is handed a [`TaskQueue`] should use it directly. This
//! accessor is for call sites that cannot be given one, such as UI
//! actions built far from the code that opens the queue.

use std::sync::OnceLock;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{NewTask, TaskHandle};
use crate::queue::TaskQueue;

static SHARED: OnceLock<TaskQueue> = OnceLock::new();

/// Install the process-wide queue. The first call wins; later calls get
/// the queue that is already installed and `queue` is dropped.
pub fn init(queue: TaskQueue) -> TaskQueue {
    let mut installed = false;
    let shared = SHARED.get_or_init(|| {
        installed = true;
        queue
    });
    if installed {
        info!("shared task queue installed");
    } else {
        debug!("shared task queue already installed");
    }
    shared.clone()
}

/// The process-wide queue, or [`Error::NotInitialized`] before [`init`].
pub fn shared() -> Result<TaskQueue> {
    SHARED.get().cloned().ok_or(Error::NotInitialized)
}

/// Submit to the process-wide queue.
pub fn submit(new: NewTask) -> Result<TaskHandle> {
    shared()?.submit(new)
}
