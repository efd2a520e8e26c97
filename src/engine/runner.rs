//! Runner passes: walk the pending set in order and execute each task.

use opentelemetry::KeyValue;
use std::collections::HashSet;
use std::ops::Bound::{Excluded, Unbounded};
use std::time::Instant;
use tracing::{Instrument, debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::model::*;
use crate::queue::TaskQueue;
use crate::telemetry::metrics;
use crate::telemetry::task::{record_state_transition, start_task_span};

impl TaskQueue {
    /// Run every pending task the automatic runner may pick, oldest first.
    ///
    /// Manually-run tasks are left alone. When a grouped task fails or is
    /// skipped, the rest of its group waits for the next pass.
    pub async fn run_tasks(&self, filter: RunFilter) -> Result<RunSummary> {
        let _pass = self.shared.run_lock.lock().await;

        let mut summary = RunSummary::default();
        let mut after = TaskId(0);
        let mut failed_groups: HashSet<String> = HashSet::new();

        loop {
            let next = {
                let state = self.lock();
                state
                    .tasks
                    .range((Excluded(after), Unbounded))
                    .map(|(_, task)| task)
                    .find(|task| {
                        !task.manually_run
                            && filter
                                .group_id
                                .as_ref()
                                .is_none_or(|g| task.group_id.as_ref() == Some(g))
                            && task
                                .group_id
                                .as_ref()
                                .is_none_or(|g| !failed_groups.contains(g))
                    })
                    .cloned()
            };
            let Some(task) = next else {
                break;
            };
            after = task.id;

            let group_id = task.group_id.clone();
            let outcome = self.execute(task).await?;
            tally(&mut summary, &outcome);

            if outcome != RunOutcome::Completed {
                if let Some(group) = group_id {
                    failed_groups.insert(group);
                }
            }
        }

        {
            let mut state = self.lock();
            self.emit(&mut state, EventKind::AllTasksComplete);
        }
        info!(
            ran = summary.ran,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            "runner pass complete"
        );

        Ok(summary)
    }

    /// Run one task now, manually-run tasks included.
    ///
    /// A grouped task can only run when it is first in its group.
    pub async fn run_task(&self, id: TaskId) -> Result<RunOutcome> {
        let _pass = self.shared.run_lock.lock().await;

        if !self.is_task_able_to_manually_run(id)? {
            return Err(Error::NotRunnable(id));
        }
        let task = self.get(id)?;
        self.execute(task).await
    }

    async fn execute(&self, task: PendingTask) -> Result<RunOutcome> {
        let id = task.id;

        let Some(runner) = self.shared.registry.get(&task.tag).cloned() else {
            warn!(%id, tag = %task.tag, "no runner for tag, dead-lettering");
            metrics::tasks_unroutable().add(1, &[KeyValue::new("tag", task.tag.clone())]);
            let mut state = self.lock();
            let dead = self.transition_locked(&mut state, id, State::Dead)?;
            self.emit(
                &mut state,
                EventKind::TaskDead {
                    id,
                    reason: format!("no runner registered for tag '{}'", task.tag),
                    attempts: dead.attempts,
                },
            );
            return Ok(RunOutcome::Unroutable);
        };

        let has_error = self.lock().errors.iter().any(|e| e.task_id == id);
        if has_error {
            return Ok(self.skip(&task, SkipReason::UnresolvedError));
        }
        if !runner.can_run(&task) {
            return Ok(self.skip(&task, SkipReason::NotReadyToRun));
        }

        let run_id = Uuid::new_v4();
        let span = start_task_span(&task.tag, id, &run_id);

        let running = {
            let mut state = self.lock();
            let running = match self.transition_locked(&mut state, id, State::Running) {
                Ok(running) => running,
                Err(Error::NotFound(_)) => {
                    debug!(%id, "task cleared before it started, discarding");
                    return Ok(RunOutcome::Discarded);
                }
                Err(e) => return Err(e),
            };
            state.running = Some(id);
            state.rerun_requested = false;
            self.emit(
                &mut state,
                EventKind::TaskRunning {
                    id,
                    attempt: running.attempts,
                },
            );
            running
        };
        record_state_transition(&span, &task.state.to_string(), "running");

        let started = Instant::now();
        let result = runner.run(&running).instrument(span.clone()).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        metrics::task_run_duration_ms().record(
            duration_ms as f64,
            &[
                KeyValue::new("tag", task.tag.clone()),
                KeyValue::new("success", result.is_success()),
            ],
        );

        let mut state = self.lock();
        state.running = None;
        let rerun = std::mem::take(&mut state.rerun_requested);

        if !state.tasks.contains_key(&id) {
            debug!(%id, "task cleared while running, discarding result");
            return Ok(RunOutcome::Discarded);
        }

        match result {
            TaskResult::Successful if rerun => {
                self.transition_locked(&mut state, id, State::Queued)?;
                record_state_transition(&span, "running", "queued");
                self.emit(
                    &mut state,
                    EventKind::TaskCompleted {
                        id,
                        success: true,
                        rescheduled: true,
                    },
                );
                info!(%id, duration_ms, "task completed, running again for newer submission");
                drop(state);
                if self.shared.config.automatically_run_tasks {
                    self.shared.wake.notify_one();
                }
                Ok(RunOutcome::Completed)
            }
            TaskResult::Successful => {
                self.transition_locked(&mut state, id, State::Completed)?;
                record_state_transition(&span, "running", "completed");
                self.emit(
                    &mut state,
                    EventKind::TaskCompleted {
                        id,
                        success: true,
                        rescheduled: false,
                    },
                );
                info!(%id, duration_ms, "task completed");
                Ok(RunOutcome::Completed)
            }
            TaskResult::Failed { report } => {
                if let Some(report) = report {
                    self.record_error_locked(&mut state, id, report.message, report.error_id);
                }
                let failed = self.transition_locked(&mut state, id, State::Failed)?;
                record_state_transition(&span, "running", "failed");

                let max = self.shared.config.max_attempts;
                if let Some(max) = max.filter(|&max| failed.attempts >= max) {
                    self.transition_locked(&mut state, id, State::Dead)?;
                    record_state_transition(&span, "failed", "dead");
                    self.emit(
                        &mut state,
                        EventKind::TaskCompleted {
                            id,
                            success: false,
                            rescheduled: false,
                        },
                    );
                    self.emit(
                        &mut state,
                        EventKind::TaskDead {
                            id,
                            reason: format!("exhausted {}/{max} attempts", failed.attempts),
                            attempts: failed.attempts,
                        },
                    );
                    warn!(%id, attempts = failed.attempts, "task failed for the last time");
                    Ok(RunOutcome::Dead)
                } else {
                    self.emit(
                        &mut state,
                        EventKind::TaskCompleted {
                            id,
                            success: false,
                            rescheduled: true,
                        },
                    );
                    warn!(%id, attempts = failed.attempts, duration_ms, "task failed, will retry");
                    Ok(RunOutcome::Failed)
                }
            }
        }
    }

    fn skip(&self, task: &PendingTask, reason: SkipReason) -> RunOutcome {
        debug!(id = %task.id, %reason, "task skipped");
        metrics::tasks_skipped().add(
            1,
            &[
                KeyValue::new("tag", task.tag.clone()),
                KeyValue::new("reason", reason.to_string()),
            ],
        );
        let mut state = self.lock();
        self.emit(&mut state, EventKind::TaskSkipped { id: task.id, reason });
        RunOutcome::Skipped(reason)
    }
}

fn tally(summary: &mut RunSummary, outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Completed => {
            summary.ran += 1;
            summary.succeeded += 1;
        }
        RunOutcome::Failed | RunOutcome::Dead => {
            summary.ran += 1;
            summary.failed += 1;
        }
        RunOutcome::Skipped(_) | RunOutcome::Unroutable => summary.skipped += 1,
        RunOutcome::Discarded => summary.ran += 1,
    }
}
