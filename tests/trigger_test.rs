//! Integration tests for the UI trigger.

use async_trait::async_trait;
use pending_tasks::TaskQueue;
use pending_tasks::config::QueueConfig;
use pending_tasks::error::Error;
use pending_tasks::model::{NewTask, PendingTask, TaskResult};
use pending_tasks::registry::{TaskRegistry, TaskRunner};
use pending_tasks::trigger::Trigger;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

struct Noop;

#[async_trait]
impl TaskRunner for Noop {
    fn tag(&self) -> &str {
        "foo"
    }

    async fn run(&self, _task: &PendingTask) -> TaskResult {
        TaskResult::Successful
    }
}

fn test_queue() -> TaskQueue {
    TaskQueue::in_memory(QueueConfig::default(), TaskRegistry::empty().register(Noop))
        .expect("failed to create queue")
}

#[test]
fn each_activation_submits_one_fresh_task() {
    let queue = test_queue();
    let built = Arc::new(AtomicU32::new(0));

    let trigger = {
        let built = built.clone();
        Trigger::new(queue.clone(), move || {
            let n = built.fetch_add(1, Ordering::SeqCst);
            NewTask::new("foo").params(json!({ "click": n }))
        })
    };

    let a = trigger.activate().unwrap();
    assert_eq!(queue.len(), 1);

    let b = trigger.activate().unwrap();
    assert_eq!(queue.len(), 2);

    assert_ne!(a.id, b.id);
    assert_eq!(built.load(Ordering::SeqCst), 2);
    assert_eq!(queue.get(a.id).unwrap().params, json!({ "click": 0 }));
    assert_eq!(queue.get(b.id).unwrap().params, json!({ "click": 1 }));
}

#[test]
fn failed_activation_returns_the_error_without_panicking() {
    let queue = test_queue();
    let trigger = Trigger::new(queue.clone(), || NewTask::new("unregistered"));

    assert!(matches!(trigger.activate(), Err(Error::InvalidTask(_))));
    assert!(queue.is_empty());
}
