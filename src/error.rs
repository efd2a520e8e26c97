//! Error types for pending-tasks.

use thiserror::Error;

use crate::model::{State, TaskId};

#[derive(Debug, Error)]
pub enum Error {
    /// The process-wide queue was used before `shared::init`.
    #[error("task queue has not been initialized")]
    NotInitialized,

    /// Structural validation failure. Fix the call site, don't retry.
    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task {0} is not able to run: it is not the first task of its group")]
    NotRunnable(TaskId),

    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: State, to: State },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
