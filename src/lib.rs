//! # pending-tasks
//!
//! Durable pending-task queue. Callers hand a task to [`TaskQueue::submit`]
//! and move on; the queue persists it to SQLite on a writer thread and a
//! control plane runs it in submission order.
//!
//! Provides the queue service, typed task kinds with a runner registry,
//! a process-wide accessor, a UI trigger, and OpenTelemetry observability.

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod queue;
pub mod registry;
pub mod shared;
pub mod storage;
pub mod telemetry;
pub mod trigger;

pub use error::{Error, Result};
pub use queue::TaskQueue;
