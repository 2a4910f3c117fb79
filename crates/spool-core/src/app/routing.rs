//! Static task → queue routing.
//!
//! Precedence, highest first: the per-call override, the configured route
//! table, the queue the task type declares, the default queue.

use std::collections::HashMap;

use crate::domain::{QueueName, TaskName};

/// Resolves the queue a task message is published to.
///
/// Precedence: per-call override, then the route table, then the queue the
/// task definition declares, then the default queue.
#[derive(Debug, Clone)]
pub struct Router {
    routes: HashMap<TaskName, QueueName>,
    default_queue: QueueName,
}

impl Router {
    pub fn new(routes: HashMap<TaskName, QueueName>, default_queue: QueueName) -> Self {
        Self {
            routes,
            default_queue,
        }
    }

    pub fn default_queue(&self) -> &QueueName {
        &self.default_queue
    }

    pub fn route(&self, task: &TaskName) -> Option<&QueueName> {
        self.routes.get(task)
    }

    pub fn resolve(
        &self,
        task: &TaskName,
        declared: Option<&QueueName>,
        routing_override: Option<&QueueName>,
    ) -> QueueName {
        routing_override
            .or_else(|| self.routes.get(task))
            .or(declared)
            .unwrap_or(&self.default_queue)
            .clone()
    }

    /// Default queue plus every routed queue, sorted and deduplicated.
    pub fn queues(&self) -> Vec<QueueName> {
        let mut queues: Vec<QueueName> = self.routes.values().cloned().collect();
        queues.push(self.default_queue.clone());
        queues.sort();
        queues.dedup();
        queues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> Router {
        let routes = HashMap::from([
            (TaskName::new("compute"), QueueName::new("compute")),
            (TaskName::new("thumbnail"), QueueName::new("media")),
        ]);
        Router::new(routes, QueueName::new("app-default"))
    }

    #[test]
    fn route_table_beats_default() {
        let q = router().resolve(&TaskName::new("compute"), None, None);
        assert_eq!(q, QueueName::new("compute"));
    }

    #[test]
    fn unrouted_task_falls_back_to_default() {
        let q = router().resolve(&TaskName::new("echo"), None, None);
        assert_eq!(q, QueueName::new("app-default"));
    }

    #[test]
    fn declared_queue_used_when_no_route() {
        let declared = QueueName::new("pings");
        let q = router().resolve(&TaskName::new("ping"), Some(&declared), None);
        assert_eq!(q, declared);
    }

    #[test]
    fn route_table_beats_declared_queue() {
        let declared = QueueName::new("elsewhere");
        let q = router().resolve(&TaskName::new("compute"), Some(&declared), None);
        assert_eq!(q, QueueName::new("compute"));
    }

    #[test]
    fn override_beats_everything() {
        let declared = QueueName::new("elsewhere");
        let urgent = QueueName::new("urgent");
        let q = router().resolve(&TaskName::new("compute"), Some(&declared), Some(&urgent));
        assert_eq!(q, urgent);
    }

    #[test]
    fn queues_lists_each_once() {
        let mut routes = HashMap::new();
        routes.insert(TaskName::new("a"), QueueName::new("shared"));
        routes.insert(TaskName::new("b"), QueueName::new("shared"));
        let router = Router::new(routes, QueueName::new("default"));

        assert_eq!(
            router.queues(),
            vec![QueueName::new("default"), QueueName::new("shared")]
        );
    }
}
