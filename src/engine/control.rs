//! Control plane: runs passes when woken by the queue, on a poll
//! interval, and until shutdown.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::config::QueueConfig;
use crate::error::Result;
use crate::model::RunFilter;
use crate::queue::TaskQueue;

/// Configuration for the control plane.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Pass interval when nothing wakes the loop.
    pub poll_interval: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self::from_queue_config(&QueueConfig::default())
    }
}

impl ControlConfig {
    pub fn from_queue_config(config: &QueueConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
        }
    }
}

/// The control plane loop: wait for work, run a pass, repeat.
#[derive(Clone)]
pub struct ControlPlane {
    queue: TaskQueue,
    config: ControlConfig,
    shutdown: Arc<Notify>,
}

impl ControlPlane {
    pub fn new(queue: TaskQueue, config: ControlConfig) -> Self {
        Self {
            queue,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Signal the control plane to shut down.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run the control plane loop until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "control plane started"
        );

        // Tasks restored from the store run straight away.
        self.pass().await;

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("control plane shutting down");
                    return Ok(());
                }
                _ = self.queue.woken() => {
                    debug!("woken by queue");
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    debug!("poll interval elapsed");
                }
            }

            self.pass().await;
        }
    }

    async fn pass(&self) {
        if !self.queue.config().automatically_run_tasks {
            debug!("automatic runs disabled, skipping pass");
            return;
        }
        if let Err(e) = self.queue.run_tasks(RunFilter::default()).await {
            error!("runner pass error: {e}");
        }
    }
}
