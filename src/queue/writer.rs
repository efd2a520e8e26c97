//! Background store writer.
//!
//! Owns the store on a dedicated thread and applies writes in the order
//! the queue accepted them. Submission only enqueues; it never waits on
//! the store.

use opentelemetry::KeyValue;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::model::{PendingTask, TaskError, TaskId};
use crate::storage::Store;
use crate::telemetry::metrics;

const RETRY_BACKOFF: Duration = Duration::from_millis(50);

pub(crate) enum StoreOp {
    InsertTask(PendingTask),
    UpdateTask(PendingTask),
    DeleteTask(TaskId),
    InsertError(TaskError),
    DeleteErrors(TaskId),
    Clear,
    /// Acknowledged once every earlier op has been applied.
    Flush(mpsc::Sender<()>),
}

impl StoreOp {
    fn name(&self) -> &'static str {
        match self {
            StoreOp::InsertTask(_) => "insert_task",
            StoreOp::UpdateTask(_) => "update_task",
            StoreOp::DeleteTask(_) => "delete_task",
            StoreOp::InsertError(_) => "insert_error",
            StoreOp::DeleteErrors(_) => "delete_errors",
            StoreOp::Clear => "clear",
            StoreOp::Flush(_) => "flush",
        }
    }
}

pub(crate) struct StoreWriter {
    tx: Option<mpsc::Sender<StoreOp>>,
    handle: Option<JoinHandle<()>>,
}

impl StoreWriter {
    pub(crate) fn spawn(store: Box<dyn Store>, retry_attempts: u32) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("pending-store-writer".to_string())
            .spawn(move || run(store, rx, retry_attempts))?;

        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Enqueue a write. Never blocks.
    pub(crate) fn send(&self, op: StoreOp) {
        let name = op.name();
        let sent = self.tx.as_ref().is_some_and(|tx| tx.send(op).is_ok());
        if !sent {
            error!(operation = name, "store writer has stopped, dropping write");
        }
    }

    /// Block until every write enqueued so far has been applied.
    pub(crate) fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = mpsc::channel();
        self.send(StoreOp::Flush(done_tx));
        done_rx
            .recv()
            .map_err(|_| Error::Other("store writer has stopped".to_string()))
    }
}

impl Drop for StoreWriter {
    fn drop(&mut self) {
        // Closing the channel lets the thread drain and exit.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(mut store: Box<dyn Store>, rx: mpsc::Receiver<StoreOp>, retry_attempts: u32) {
    debug!("store writer started");
    for op in rx {
        match op {
            StoreOp::Flush(done) => {
                let _ = done.send(());
            }
            op => apply_with_retry(store.as_mut(), &op, retry_attempts.max(1)),
        }
    }
    debug!("store writer stopped");
}

fn apply_with_retry(store: &mut dyn Store, op: &StoreOp, attempts: u32) {
    for attempt in 1..=attempts {
        match apply(store, op) {
            Ok(()) => {
                metrics::store_writes().add(
                    1,
                    &[
                        KeyValue::new("operation", op.name()),
                        KeyValue::new("result", "ok"),
                    ],
                );
                return;
            }
            Err(e) if attempt < attempts => {
                warn!(operation = op.name(), attempt, error = %e, "store write failed, retrying");
                thread::sleep(RETRY_BACKOFF * attempt);
            }
            Err(e) => {
                error!(operation = op.name(), attempts, error = %e, "store write failed, giving up");
                metrics::store_writes().add(
                    1,
                    &[
                        KeyValue::new("operation", op.name()),
                        KeyValue::new("result", "error"),
                    ],
                );
            }
        }
    }
}

fn apply(store: &mut dyn Store, op: &StoreOp) -> Result<()> {
    match op {
        StoreOp::InsertTask(task) => store.insert_task(task),
        StoreOp::UpdateTask(task) => store.update_task(task),
        StoreOp::DeleteTask(id) => store.delete_task(*id),
        StoreOp::InsertError(error) => store.insert_error(error),
        StoreOp::DeleteErrors(task_id) => store.delete_errors(*task_id),
        StoreOp::Clear => store.clear(),
        StoreOp::Flush(_) => Ok(()),
    }
}
