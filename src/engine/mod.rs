//! Runner engine: runner passes over the pending set, and the control
//! plane that triggers them.

pub mod control;
mod runner;

pub use control::{ControlConfig, ControlPlane};
