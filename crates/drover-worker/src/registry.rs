use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::task::TaskHandler;

/// Name-to-handler lookup consulted for every claimed job.
pub trait TaskRegistry: Send + Sync + 'static {
    fn lookup(&self, identifier: &str) -> Option<Arc<dyn TaskHandler>>;

    /// Names this process can run. Only these are ever claimed.
    fn names(&self) -> Vec<String>;
}

/// A fixed set of handlers.
#[derive(Clone, Default)]
pub struct TaskList {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`TaskList::insert`].
    pub fn with(mut self, identifier: impl Into<String>, handler: impl TaskHandler) -> Self {
        self.insert(identifier, handler);
        self
    }

    /// Register a handler; a second registration under the same name replaces the first.
    pub fn insert(&mut self, identifier: impl Into<String>, handler: impl TaskHandler) {
        let identifier = identifier.into();
        debug!(task = %identifier, "task registered");
        self.handlers.insert(identifier, Arc::new(handler));
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl TaskRegistry for TaskList {
    fn lookup(&self, identifier: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(identifier).cloned()
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

/// A task list that can be swapped while workers run. Jobs already executing
/// keep the handler they started with.
#[derive(Default)]
pub struct ReloadableTasks {
    current: RwLock<Arc<TaskList>>,
}

impl ReloadableTasks {
    pub fn new(tasks: TaskList) -> Self {
        Self {
            current: RwLock::new(Arc::new(tasks)),
        }
    }

    pub fn replace(&self, tasks: TaskList) {
        let count = tasks.len();
        *self.current.write().expect("task registry poisoned") = Arc::new(tasks);
        debug!(tasks = count, "task list replaced");
    }

    pub fn snapshot(&self) -> Arc<TaskList> {
        self.current.read().expect("task registry poisoned").clone()
    }
}

impl TaskRegistry for ReloadableTasks {
    fn lookup(&self, identifier: &str) -> Option<Arc<dyn TaskHandler>> {
        self.snapshot().lookup(identifier)
    }

    fn names(&self) -> Vec<String> {
        self.snapshot().names()
    }
}
