//! Per-invocation execution context.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::ids::{MessageId, WorkerId};
use super::task::{QueueName, TaskName};

/// Facts about the invocation in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationMeta {
    pub message_id: MessageId,
    pub task_name: TaskName,
    pub queue: QueueName,
    /// `None` when the task runs eagerly in the caller.
    pub worker_id: Option<WorkerId>,
    pub delivery_count: u32,
}

impl InvocationMeta {
    pub fn is_eager(&self) -> bool {
        self.worker_id.is_none()
    }
}

/// Scope established right before a handler runs and released right after.
///
/// Resources are stored by type; a provider inserts what handlers need (a
/// database session, a tenant, ...) and takes it back out on release. A
/// context belongs to exactly one invocation.
pub struct ExecutionContext {
    meta: InvocationMeta,
    started_at: DateTime<Utc>,
    resources: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl ExecutionContext {
    pub fn new(meta: InvocationMeta) -> Self {
        Self {
            meta,
            started_at: Utc::now(),
            resources: HashMap::new(),
        }
    }

    pub fn meta(&self) -> &InvocationMeta {
        &self.meta
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, resource: T) {
        self.resources.insert(TypeId::of::<T>(), Box::new(resource));
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.resources
            .get(&TypeId::of::<T>())
            .and_then(|r| r.downcast_ref::<T>())
    }

    pub fn take<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.resources
            .remove(&TypeId::of::<T>())
            .and_then(|r| r.downcast::<T>().ok())
            .map(|r| *r)
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("meta", &self.meta)
            .field("started_at", &self.started_at)
            .field("resources", &self.resources.len())
            .finish()
    }
}
