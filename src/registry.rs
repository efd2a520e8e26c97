//! Task runners and the registry that routes tags to them.
//!
//! Each task kind registers one runner under its tag. Submission rejects
//! tags the registry doesn't know; the runner engine looks the runner up
//! again when the task's turn comes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::model::{PendingTask, TaskResult};

/// Executes tasks of one kind.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// The tag this runner handles.
    fn tag(&self) -> &str;

    /// Payload schema check, applied at submission. Return a message
    /// describing what's wrong to reject the task.
    fn validate(&self, _params: &serde_json::Value) -> Result<(), String> {
        Ok(())
    }

    /// Whether the task may run right now. A `false` skips it for this pass.
    fn can_run(&self, _task: &PendingTask) -> bool {
        true
    }

    async fn run(&self, task: &PendingTask) -> TaskResult;
}

/// Registry of task runners, indexed by tag.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    runners: HashMap<String, Arc<dyn TaskRunner>>,
}

impl TaskRegistry {
    /// Create an empty registry with no runners.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add a runner, replacing any previous runner for the same tag.
    pub fn register(mut self, runner: impl TaskRunner + 'static) -> Self {
        self.insert(Arc::new(runner));
        self
    }

    pub fn insert(&mut self, runner: Arc<dyn TaskRunner>) {
        self.runners.insert(runner.tag().to_string(), runner);
    }

    /// Look up a runner by tag.
    pub fn get(&self, tag: &str) -> Option<&Arc<dyn TaskRunner>> {
        self.runners.get(tag)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.runners.contains_key(tag)
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.runners.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl TaskRunner for Named {
        fn tag(&self) -> &str {
            self.0
        }

        async fn run(&self, _task: &PendingTask) -> TaskResult {
            TaskResult::Successful
        }
    }

    #[test]
    fn registers_by_tag() {
        let registry = TaskRegistry::empty().register(Named("sync")).register(Named("upload"));

        assert!(registry.contains("sync"));
        assert!(registry.get("upload").is_some());
        assert!(registry.get("download").is_none());
        assert_eq!(registry.tags(), vec!["sync", "upload"]);
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let registry = TaskRegistry::empty().register(Named("sync")).register(Named("sync"));
        assert_eq!(registry.tags().len(), 1);
    }
}
