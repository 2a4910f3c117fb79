//! TaskRegistry: task name → definition, built once at startup.
//!
//! Registration is explicit. The registry is mutable while the application
//! is assembled and shared read-only (`Arc`) afterwards, so lookups need no
//! locking.

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{Handler, TaskHandler, TypedHandler};
use super::task::Task;
use crate::domain::{QueueName, SpoolError, TaskName};

/// Immutable binding of a task name to its handler and declared queue.
#[derive(Clone)]
pub struct TaskDefinition {
    name: TaskName,
    queue: Option<QueueName>,
    handler: Arc<dyn TaskHandler>,
}

impl TaskDefinition {
    pub fn new(name: impl Into<TaskName>, handler: Arc<dyn TaskHandler>) -> Self {
        Self {
            name: name.into(),
            queue: None,
            handler,
        }
    }

    /// Declare the queue this task goes to when no route overrides it.
    pub fn on_queue(mut self, queue: impl Into<QueueName>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn name(&self) -> &TaskName {
        &self.name
    }

    pub fn queue(&self) -> Option<&QueueName> {
        self.queue.as_ref()
    }

    pub fn handler(&self) -> &Arc<dyn TaskHandler> {
        &self.handler
    }
}

impl std::fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: HashMap<TaskName, TaskDefinition>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    pub fn register(&mut self, definition: TaskDefinition) -> Result<(), SpoolError> {
        if self.tasks.contains_key(definition.name()) {
            return Err(SpoolError::DuplicateTask(definition.name().clone()));
        }
        self.tasks.insert(definition.name().clone(), definition);
        Ok(())
    }

    /// Register a typed handler under `T::NAME`, on `T::QUEUE` if declared.
    pub fn register_task<T: Task, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), SpoolError> {
        let mut definition =
            TaskDefinition::new(T::NAME, Arc::new(TypedHandler::<T, H>::new(handler)));
        if let Some(queue) = T::QUEUE {
            definition = definition.on_queue(queue);
        }
        self.register(definition)
    }

    pub fn get(&self, name: &TaskName) -> Option<&TaskDefinition> {
        self.tasks.get(name)
    }

    pub fn contains(&self, name: &TaskName) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<TaskName> {
        let mut names: Vec<TaskName> = self.tasks.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
