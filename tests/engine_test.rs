//! Integration tests for the runner engine and control plane.

use async_trait::async_trait;
use pending_tasks::TaskQueue;
use pending_tasks::config::QueueConfig;
use pending_tasks::engine::{ControlConfig, ControlPlane};
use pending_tasks::error::Error;
use pending_tasks::event::{Event, EventKind};
use pending_tasks::model::*;
use pending_tasks::registry::{TaskRegistry, TaskRunner};
use pending_tasks::storage::MemoryStore;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};

/// Runner whose results are queued up by the test. Runs that find the
/// script empty succeed. Every run is logged.
#[derive(Clone, Default)]
struct Scripted {
    results: Arc<Mutex<VecDeque<TaskResult>>>,
    ran: Arc<Mutex<Vec<TaskId>>>,
    ready: Arc<AtomicBool>,
}

impl Scripted {
    fn new() -> Self {
        let runner = Self::default();
        runner.ready.store(true, Ordering::SeqCst);
        runner
    }

    fn then(&self, result: TaskResult) -> &Self {
        self.results.lock().unwrap().push_back(result);
        self
    }

    fn ran(&self) -> Vec<TaskId> {
        self.ran.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskRunner for Scripted {
    fn tag(&self) -> &str {
        "work"
    }

    fn can_run(&self, _task: &PendingTask) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn run(&self, task: &PendingTask) -> TaskResult {
        self.ran.lock().unwrap().push(task.id);
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(TaskResult::Successful)
    }
}

fn queue_with(runner: &Scripted, config: QueueConfig) -> TaskQueue {
    let registry = TaskRegistry::empty().register(runner.clone());
    TaskQueue::in_memory(config, registry).expect("failed to create queue")
}

fn manual_config() -> QueueConfig {
    QueueConfig {
        automatically_run_tasks: false,
        ..QueueConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Runner passes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_task_leaves_the_queue() {
    let runner = Scripted::new();
    let queue = queue_with(&runner, manual_config());

    let a = queue.submit(NewTask::new("work")).unwrap();
    let b = queue.submit(NewTask::new("work")).unwrap();

    let summary = queue.run_tasks(RunFilter::default()).await.unwrap();

    assert_eq!(summary.ran, 2);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(runner.ran(), vec![a.id, b.id]);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn failed_task_stays_and_blocks_the_rest_of_its_group() {
    let runner = Scripted::new();
    runner.then(TaskResult::failed());
    let queue = queue_with(&runner, manual_config());

    let first = queue.submit(NewTask::new("work").group("g")).unwrap();
    let second = queue.submit(NewTask::new("work").group("g")).unwrap();
    let other = queue.submit(NewTask::new("work").group("h")).unwrap();

    let summary = queue.run_tasks(RunFilter::default()).await.unwrap();

    assert_eq!(summary.ran, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(runner.ran(), vec![first.id, other.id]);

    let failed = queue.get(first.id).unwrap();
    assert_eq!(failed.state, State::Failed);
    assert_eq!(failed.attempts, 1);
    assert_eq!(queue.get(second.id).unwrap().state, State::Queued);

    // Next pass retries the failed task, then the group moves on.
    queue.run_tasks(RunFilter::default()).await.unwrap();
    assert_eq!(runner.ran(), vec![first.id, other.id, first.id, second.id]);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn run_filter_limits_the_pass_to_one_group() {
    let runner = Scripted::new();
    let queue = queue_with(&runner, manual_config());

    let g = queue.submit(NewTask::new("work").group("g")).unwrap();
    let h = queue.submit(NewTask::new("work").group("h")).unwrap();

    queue.run_tasks(RunFilter::group("h")).await.unwrap();

    assert_eq!(runner.ran(), vec![h.id]);
    assert_eq!(queue.pending()[0].id, g.id);
}

#[tokio::test]
async fn manual_tasks_only_run_when_asked() {
    let runner = Scripted::new();
    let queue = queue_with(&runner, manual_config());

    let manual = queue
        .submit(NewTask::new("work").manually_run(true))
        .unwrap();

    let summary = queue.run_tasks(RunFilter::default()).await.unwrap();
    assert_eq!(summary, RunSummary::default());
    assert_eq!(queue.len(), 1);

    let outcome = queue.run_task(manual.id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn run_task_refuses_a_task_behind_others_in_its_group() {
    let runner = Scripted::new();
    let queue = queue_with(&runner, manual_config());

    queue.submit(NewTask::new("work").group("g")).unwrap();
    let second = queue.submit(NewTask::new("work").group("g")).unwrap();

    match queue.run_task(second.id).await {
        Err(Error::NotRunnable(id)) => assert_eq!(id, second.id),
        other => panic!("expected NotRunnable, got {other:?}"),
    }
    assert!(runner.ran().is_empty());

    assert!(matches!(
        queue.run_task(TaskId(999)).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn task_not_ready_is_skipped() {
    let runner = Scripted::new();
    runner.ready.store(false, Ordering::SeqCst);
    let queue = queue_with(&runner, manual_config());

    let handle = queue.submit(NewTask::new("work")).unwrap();

    let outcome = queue.run_task(handle.id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Skipped(SkipReason::NotReadyToRun));
    assert_eq!(queue.get(handle.id).unwrap().attempts, 0);
}

#[tokio::test]
async fn recorded_error_blocks_task_until_resolved() {
    let runner = Scripted::new();
    runner.then(TaskResult::failed_with("quota exceeded", Some("Q1".to_string())));
    let queue = queue_with(&runner, manual_config());

    let handle = queue.submit(NewTask::new("work")).unwrap();

    assert_eq!(
        queue.run_task(handle.id).await.unwrap(),
        RunOutcome::Failed
    );
    let error = queue.latest_error(handle.id).unwrap().unwrap();
    assert_eq!(error.message.as_deref(), Some("quota exceeded"));
    assert_eq!(error.error_id.as_deref(), Some("Q1"));

    let summary = queue.run_tasks(RunFilter::default()).await.unwrap();
    assert_eq!(summary.skipped, 1);
    assert_eq!(runner.ran().len(), 1);

    assert!(queue.resolve_error(handle.id).unwrap());
    assert!(!queue.resolve_error(handle.id).unwrap());

    queue.run_tasks(RunFilter::default()).await.unwrap();
    assert_eq!(runner.ran().len(), 2);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn task_goes_dead_after_max_attempts() {
    let runner = Scripted::new();
    runner.then(TaskResult::failed()).then(TaskResult::failed());
    let queue = queue_with(
        &runner,
        QueueConfig {
            max_attempts: Some(2),
            ..manual_config()
        },
    );

    let handle = queue.submit(NewTask::new("work")).unwrap();

    assert_eq!(
        queue.run_task(handle.id).await.unwrap(),
        RunOutcome::Failed
    );
    assert_eq!(queue.run_task(handle.id).await.unwrap(), RunOutcome::Dead);

    assert!(queue.is_empty());
    let dead = queue.dead();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, handle.id);
    assert_eq!(dead[0].state, State::Dead);
    assert_eq!(dead[0].attempts, 2);
}

#[tokio::test]
async fn task_without_runner_is_dead_lettered() {
    let store = MemoryStore::new();
    let runner = Scripted::new();

    let id = {
        let registry = TaskRegistry::empty().register(runner.clone());
        let queue = TaskQueue::open(manual_config(), registry, store.clone()).unwrap();
        let handle = queue.submit(NewTask::new("work")).unwrap();
        queue.flush().unwrap();
        handle.id
    };

    // Reopened without a runner for "work".
    let queue = TaskQueue::open(manual_config(), TaskRegistry::empty(), store.clone()).unwrap();
    let summary = queue.run_tasks(RunFilter::default()).await.unwrap();

    assert_eq!(summary.skipped, 1);
    assert!(queue.is_empty());
    assert_eq!(queue.dead()[0].id, id);
    assert!(runner.ran().is_empty());

    queue.flush().unwrap();
    assert_eq!(store.tasks()[0].state, State::Dead);
}

/// Runner that holds its first run open until released.
#[derive(Clone, Default)]
struct Gated {
    started: Arc<Notify>,
    release: Arc<Notify>,
    runs: Arc<Mutex<u32>>,
}

#[async_trait]
impl TaskRunner for Gated {
    fn tag(&self) -> &str {
        "gated"
    }

    async fn run(&self, _task: &PendingTask) -> TaskResult {
        *self.runs.lock().unwrap() += 1;
        self.started.notify_one();
        self.release.notified().await;
        TaskResult::Successful
    }
}

#[tokio::test]
async fn resubmitting_a_running_task_runs_it_again() {
    let runner = Gated::default();
    let registry = TaskRegistry::empty().register(runner.clone());
    let queue = TaskQueue::in_memory(manual_config(), registry).unwrap();

    let handle = queue
        .submit(NewTask::new("gated").data_id("doc-1"))
        .unwrap();

    let running = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.run_task(handle.id).await })
    };
    runner.started.notified().await;

    let again = queue
        .submit(NewTask::new("gated").data_id("doc-1"))
        .unwrap();
    assert_eq!(again.acceptance, Acceptance::RerunScheduled);
    assert_eq!(again.id, handle.id);

    runner.release.notify_one();
    assert_eq!(running.await.unwrap().unwrap(), RunOutcome::Completed);

    let requeued = queue.get(handle.id).unwrap();
    assert_eq!(requeued.state, State::Queued);

    runner.release.notify_one();
    queue.run_tasks(RunFilter::default()).await.unwrap();
    assert_eq!(*runner.runs.lock().unwrap(), 2);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn error_recorded_during_a_successful_run_leaves_with_the_task() {
    let runner = Gated::default();
    let store = MemoryStore::new();
    let registry = TaskRegistry::empty().register(runner.clone());
    let queue = TaskQueue::open(manual_config(), registry, store.clone()).unwrap();

    let handle = queue.submit(NewTask::new("gated")).unwrap();

    let running = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.run_task(handle.id).await })
    };
    runner.started.notified().await;

    queue
        .record_error(handle.id, Some("transient".to_string()), None)
        .unwrap();
    runner.release.notify_one();
    assert_eq!(running.await.unwrap().unwrap(), RunOutcome::Completed);

    assert!(queue.is_empty());
    assert!(queue.errors().is_empty());

    queue.flush().unwrap();
    assert!(store.tasks().is_empty());
    assert!(store.errors().is_empty());
}

#[tokio::test]
async fn clearing_the_queue_mid_run_discards_the_result() {
    let runner = Gated::default();
    let registry = TaskRegistry::empty().register(runner.clone());
    let queue = TaskQueue::in_memory(manual_config(), registry).unwrap();

    let handle = queue.submit(NewTask::new("gated")).unwrap();

    let running = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.run_task(handle.id).await })
    };
    runner.started.notified().await;

    queue.clear().unwrap();
    runner.release.notify_one();

    assert_eq!(running.await.unwrap().unwrap(), RunOutcome::Discarded);
    assert!(queue.is_empty());
    assert!(queue.dead().is_empty());
}

/// Runner that clears its queue when asked whether it can run.
#[derive(Clone, Default)]
struct Clearing {
    queue: Arc<OnceLock<TaskQueue>>,
}

#[async_trait]
impl TaskRunner for Clearing {
    fn tag(&self) -> &str {
        "clearing"
    }

    fn can_run(&self, _task: &PendingTask) -> bool {
        if let Some(queue) = self.queue.get() {
            queue.clear().unwrap();
        }
        true
    }

    async fn run(&self, _task: &PendingTask) -> TaskResult {
        panic!("a cleared task must not run");
    }
}

#[tokio::test]
async fn task_cleared_before_it_starts_does_not_end_the_pass() {
    let runner = Clearing::default();
    let registry = TaskRegistry::empty().register(runner.clone());
    let queue = TaskQueue::in_memory(manual_config(), registry).unwrap();
    let _ = runner.queue.set(queue.clone());

    queue.submit(NewTask::new("clearing")).unwrap();

    let summary = queue.run_tasks(RunFilter::default()).await.unwrap();
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.failed, 0);
    assert!(queue.is_empty());
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn events_follow_the_task_lifecycle_in_sequence() {
    let runner = Scripted::new();
    let queue = queue_with(&runner, manual_config());
    let mut events = queue.subscribe();

    let handle = queue.submit(NewTask::new("work")).unwrap();
    queue.run_tasks(RunFilter::default()).await.unwrap();

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }

    assert!(received.windows(2).all(|w| w[0].seq < w[1].seq));
    assert!(received[..3].iter().all(|e| e.task_id() == Some(handle.id)));
    assert_eq!(received[3].task_id(), None);
    let kinds: Vec<EventKind> = received.into_iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::TaskAdded {
                id: handle.id,
                tag: "work".to_string(),
                group_id: None,
            },
            EventKind::TaskRunning {
                id: handle.id,
                attempt: 1,
            },
            EventKind::TaskCompleted {
                id: handle.id,
                success: true,
                rescheduled: false,
            },
            EventKind::AllTasksComplete,
        ]
    );
}

// ---------------------------------------------------------------------------
// Control plane
// ---------------------------------------------------------------------------

#[tokio::test]
async fn control_plane_runs_submitted_tasks() {
    let runner = Scripted::new();
    let queue = queue_with(&runner, QueueConfig::default());
    let mut events = queue.subscribe();

    let control = ControlPlane::new(queue.clone(), ControlConfig::default());
    let daemon = {
        let control = control.clone();
        tokio::spawn(async move { control.run().await })
    };

    let handle = queue.submit(NewTask::new("work")).unwrap();

    let completed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if let EventKind::TaskCompleted { id, success, .. } = event.kind {
                return (id, success);
            }
        }
    })
    .await
    .expect("task was not run");
    assert_eq!(completed, (handle.id, true));
    assert!(queue.is_empty());

    control.shutdown();
    daemon.await.unwrap().unwrap();
}

#[tokio::test]
async fn resolving_an_error_wakes_the_control_plane() {
    let runner = Scripted::new();
    runner.then(TaskResult::failed_with("offline", None));
    let queue = queue_with(&runner, QueueConfig::default());
    let mut events = queue.subscribe();

    let control = ControlPlane::new(queue.clone(), ControlConfig::default());
    let daemon = {
        let control = control.clone();
        tokio::spawn(async move { control.run().await })
    };

    let handle = queue.submit(NewTask::new("work")).unwrap();
    let first = next_completion(&mut events).await;
    assert_eq!(first, (handle.id, false));
    assert_eq!(queue.errors().len(), 1);

    // Nothing else wakes the loop; the poll interval is fifteen minutes.
    assert!(queue.resolve_error(handle.id).unwrap());
    let second = next_completion(&mut events).await;
    assert_eq!(second, (handle.id, true));
    assert!(queue.is_empty());

    control.shutdown();
    daemon.await.unwrap().unwrap();
}

async fn next_completion(events: &mut broadcast::Receiver<Event>) -> (TaskId, bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if let EventKind::TaskCompleted { id, success, .. } = event.kind {
                return (id, success);
            }
        }
    })
    .await
    .expect("no task completed")
}

#[tokio::test]
async fn control_plane_leaves_tasks_alone_when_automatic_runs_are_off() {
    let runner = Scripted::new();
    let queue = queue_with(&runner, manual_config());

    let control = ControlPlane::new(
        queue.clone(),
        ControlConfig {
            poll_interval: Duration::from_millis(10),
        },
    );
    let daemon = {
        let control = control.clone();
        tokio::spawn(async move { control.run().await })
    };

    queue.submit(NewTask::new("work")).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(queue.len(), 1);
    assert!(runner.ran().is_empty());

    control.shutdown();
    daemon.await.unwrap().unwrap();
}
