//! AppBuilder - wiring and fail-fast startup checks.
//!
//! All process-wide state (registry, router, broker, dispatcher) lives in the
//! `App` built here; nothing is global.

use std::sync::Arc;
use std::time::Duration;

use crate::domain::{QueueName, SpoolError};
use crate::impls::InMemoryBroker;
use crate::ports::{BasicContextProvider, Broker, Clock, ContextProvider, QueueStats};
use crate::typed::{Handler, Task, TaskDefinition, TaskRegistry};

use super::config::SpoolConfig;
use super::dispatcher::Dispatcher;
use super::executor::Executor;
use super::pool::WorkerPool;
use super::routing::Router;
use super::worker::{Worker, WorkerConfig};

/// Builds an [`App`].
///
/// ```ignore
/// let app = AppBuilder::new()
///     .config(SpoolConfig::from_env()?)
///     .register_task::<Compute, _>(ComputeHandler)?
///     .expect_tasks(&["compute"])
///     .build()
///     .await?;
/// ```
pub struct AppBuilder {
    config: SpoolConfig,
    registry: TaskRegistry,
    expected_tasks: Option<Vec<String>>,
    broker: Option<Arc<dyn Broker>>,
    contexts: Arc<dyn ContextProvider>,
    clock: Option<Arc<dyn Clock>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error("failed to declare queues: {0}")]
    Broker(#[from] SpoolError),
}

impl AppBuilder {
    /// Starts from [`SpoolConfig::local`] with a `default` queue.
    pub fn new() -> Self {
        Self {
            config: SpoolConfig::local("default"),
            registry: TaskRegistry::new(),
            expected_tasks: None,
            broker: None,
            contexts: Arc::new(BasicContextProvider),
            clock: None,
        }
    }

    pub fn config(mut self, config: SpoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn register(mut self, definition: TaskDefinition) -> Result<Self, SpoolError> {
        self.registry.register(definition)?;
        Ok(self)
    }

    pub fn register_task<T: Task, H: Handler<T> + 'static>(mut self, handler: H) -> Result<Self, SpoolError> {
        self.registry.register_task::<T, H>(handler)?;
        Ok(self)
    }

    /// Names that must be registered by the time `build` runs.
    pub fn expect_tasks(mut self, names: &[&str]) -> Self {
        self.expected_tasks = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    /// Defaults to an [`InMemoryBroker`] honoring `create_missing_queues`.
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn context_provider(mut self, contexts: Arc<dyn ContextProvider>) -> Self {
        self.contexts = contexts;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Check expected tasks, declare every queue the app serves, wire the
    /// dispatcher.
    pub async fn build(self) -> Result<App, BuildError> {
        if let Some(expected_tasks) = &self.expected_tasks {
            let registered = self.registry.names();
            let missing: Vec<String> = expected_tasks
                .iter()
                .filter(|name| !registered.iter().any(|r| r.as_str() == name.as_str()))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing));
            }
        }

        for (task, queue) in &self.config.routes {
            if !self.registry.contains(task) {
                tracing::warn!(task = %task, queue = %queue, "route configured for unregistered task");
            }
        }

        let create_missing_queues = self.config.create_missing_queues;
        let broker = self.broker.unwrap_or_else(|| {
            Arc::new(InMemoryBroker::new(create_missing_queues)) as Arc<dyn Broker>
        });
        let queues = serving_queues(&self.config.router(), &self.registry);
        for queue in &queues {
            broker.declare_queue(queue).await?;
        }

        let registry = Arc::new(self.registry);
        let executor = Arc::new(Executor::new(
            Arc::clone(&registry),
            self.contexts,
            self.config.failure_policy,
            self.config.unknown_task_policy,
        ));
        let mut dispatcher = Dispatcher::new(&self.config, Arc::clone(&broker), Arc::clone(&executor));
        if let Some(clock) = self.clock {
            dispatcher = dispatcher.with_clock(clock);
        }

        tracing::info!(
            broker = %self.config.broker.redacted_url(),
            tasks = ?registry.names(),
            queues = ?queues,
            eager = self.config.eager,
            "app ready"
        );

        Ok(App {
            config: self.config,
            registry,
            broker,
            executor,
            dispatcher,
            queues,
            pool: None,
        })
    }
}

/// Every queue a dispatched message can land on without an explicit
/// override: the default queue, the routed queues, and the queue a task
/// declares for itself when no route covers that task.
fn serving_queues(router: &Router, registry: &TaskRegistry) -> Vec<QueueName> {
    let mut queues = router.queues();
    for name in registry.names() {
        if router.route(&name).is_some() {
            continue;
        }
        if let Some(queue) = registry.get(&name).and_then(|d| d.queue()) {
            queues.push(queue.clone());
        }
    }
    queues.sort();
    queues.dedup();
    queues
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A wired application: explicit init through [`AppBuilder::build`],
/// explicit teardown through [`App::shutdown`].
pub struct App {
    config: SpoolConfig,
    registry: Arc<TaskRegistry>,
    broker: Arc<dyn Broker>,
    executor: Arc<Executor>,
    dispatcher: Dispatcher,
    queues: Vec<QueueName>,
    pool: Option<WorkerPool>,
}

impl App {
    pub fn config(&self) -> &SpoolConfig {
        &self.config
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Queues declared at build: default, routed, and unrouted task queues.
    pub fn queues(&self) -> Vec<QueueName> {
        self.queues.clone()
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// A standalone worker; an empty `queues` means every configured queue.
    pub fn worker(&self, queues: Vec<QueueName>) -> Worker {
        Worker::new(
            self.worker_config(queues),
            Arc::clone(&self.broker),
            self.config.codec(),
            Arc::clone(&self.executor),
        )
    }

    /// Spawn `n` workers over `queues` (every configured queue when empty).
    /// A pool that is already running is returned unchanged.
    pub fn start_workers(&mut self, n: usize, queues: Vec<QueueName>) -> &WorkerPool {
        if self.pool.is_some() {
            tracing::warn!("workers already started");
        }
        let config = self.worker_config(queues);
        let broker = Arc::clone(&self.broker);
        let codec = self.config.codec();
        let executor = Arc::clone(&self.executor);
        self.pool
            .get_or_insert_with(|| WorkerPool::spawn(n, config, broker, codec, executor))
    }

    pub async fn stats(&self) -> Vec<(QueueName, QueueStats)> {
        let mut stats = Vec::new();
        for queue in self.queues() {
            let s = self.broker.stats(&queue).await.unwrap_or_default();
            stats.push((queue, s));
        }
        stats
    }

    /// Wait until no configured queue has ready or unacked messages.
    /// Returns false if that did not happen within `timeout`.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let idle = async {
            loop {
                let busy = self
                    .stats()
                    .await
                    .iter()
                    .any(|(_, s)| s.ready > 0 || s.unacked > 0);
                if !busy {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(timeout, idle).await.is_ok()
    }

    /// Stop the workers (in-flight tasks finish) and close the broker.
    pub async fn shutdown(mut self) {
        if let Some(pool) = self.pool.take() {
            pool.shutdown_and_join().await;
        }
        self.broker.close().await;
        tracing::info!("app shut down");
    }

    fn worker_config(&self, queues: Vec<QueueName>) -> WorkerConfig {
        if queues.is_empty() {
            WorkerConfig::new(self.queues())
        } else {
            WorkerConfig::new(queues)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::app::executor::fixtures::RecordingContexts;
    use crate::domain::{Disposition, HandlerError, TaskArgs};
    use crate::typed::handler::fixtures::{DoubleHandler, PingHandler};
    use crate::typed::handler_fn;
    use crate::typed::task::fixtures::{Double, Ping};
    use serde_json::{Value, json};

    #[tokio::test]
    async fn build_success() {
        let app = AppBuilder::new()
            .register_task::<Double, _>(DoubleHandler)
            .unwrap()
            .expect_tasks(&[Double::NAME])
            .build()
            .await;
        assert!(app.is_ok());
    }

    #[tokio::test]
    async fn build_missing_task_types() {
        let app = AppBuilder::new()
            .register_task::<Double, _>(DoubleHandler)
            .unwrap()
            .expect_tasks(&[Double::NAME, Ping::NAME])
            .build()
            .await;
        assert!(matches!(
            app,
            Err(BuildError::MissingTaskTypes(missing)) if missing == vec![Ping::NAME.to_string()]
        ));
    }

    #[tokio::test]
    async fn duplicate_registration_is_refused() {
        let result = AppBuilder::new()
            .register_task::<Double, _>(DoubleHandler)
            .unwrap()
            .register_task::<Double, _>(DoubleHandler);
        assert!(matches!(result, Err(SpoolError::DuplicateTask(_))));
    }

    #[tokio::test]
    async fn build_declares_routed_default_and_task_queues() {
        let mut config = SpoolConfig::local("app-default");
        config.create_missing_queues = false;
        config.route_default("double", "math");
        config.route_default("shadowed", "math");
        let app = AppBuilder::new()
            .config(config)
            .register_task::<Double, _>(DoubleHandler)
            .unwrap()
            .register_task::<Ping, _>(PingHandler)
            .unwrap()
            .register(
                TaskDefinition::new(
                    "shadowed",
                    Arc::new(handler_fn(|_args| async { Ok(Value::Null) })),
                )
                .on_queue("never-used"),
            )
            .unwrap()
            .build()
            .await
            .unwrap();

        assert!(app.broker().queue_exists(&QueueName::new("math")).await);
        assert!(app.broker().queue_exists(&QueueName::new("app-default")).await);
        assert!(app.broker().queue_exists(&QueueName::new("pings")).await);
        // a route wins over the declared queue, so that one is never needed
        assert!(!app.broker().queue_exists(&QueueName::new("never-used")).await);
        assert_eq!(
            app.queues(),
            vec![
                QueueName::new("app-default"),
                QueueName::new("math"),
                QueueName::new("pings"),
            ]
        );

        app.dispatcher().enqueue_task(&Ping {}).await.unwrap();
        app.dispatcher().enqueue_task(&Double { value: 1 }).await.unwrap();
    }

    #[tokio::test]
    async fn declared_queue_is_drained_without_a_route() {
        let mut app = AppBuilder::new()
            .register_task::<Ping, _>(PingHandler)
            .unwrap()
            .build()
            .await
            .unwrap();

        app.dispatcher().enqueue_task(&Ping {}).await.unwrap();
        app.start_workers(2, Vec::new());
        assert!(app.wait_idle(Duration::from_secs(2)).await);

        let pings = app
            .broker()
            .stats(&QueueName::new("pings"))
            .await
            .unwrap_or_default();
        assert_eq!(pings, QueueStats { ready: 0, unacked: 0, acked: 1, dead_lettered: 0 });
        app.shutdown().await;
    }

    fn recording_app(config: SpoolConfig, log: Arc<Mutex<Vec<Value>>>) -> AppBuilder {
        AppBuilder::new()
            .config(config)
            .register(TaskDefinition::new(
                "record",
                Arc::new(handler_fn(move |args: TaskArgs| {
                    let log = log.clone();
                    async move {
                        let value = json!({"args": args.args, "kwargs": args.kwargs});
                        log.lock().unwrap().push(value.clone());
                        Ok(value)
                    }
                })),
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn eager_and_async_have_identical_side_effects() {
        let requests = [
            TaskArgs::new().kwarg("random_number", 1234).kwarg("now_timestamp", "2024-01-01T00:00:00"),
            TaskArgs::positional(vec![json!(1), json!("two"), json!([3.5])]),
            TaskArgs::new(),
        ];

        let eager_log = Arc::new(Mutex::new(Vec::new()));
        let mut eager = SpoolConfig::local("default");
        eager.eager = true;
        let eager_app = recording_app(eager, eager_log.clone()).build().await.unwrap();
        for args in requests.clone() {
            eager_app.dispatcher().enqueue("record", args, None).await.unwrap();
        }

        let async_log = Arc::new(Mutex::new(Vec::new()));
        let mut async_app = recording_app(SpoolConfig::local("default"), async_log.clone())
            .build()
            .await
            .unwrap();
        for args in requests.clone() {
            async_app.dispatcher().enqueue("record", args, None).await.unwrap();
        }
        assert!(async_log.lock().unwrap().is_empty());
        async_app.start_workers(1, Vec::new());
        assert!(async_app.wait_idle(Duration::from_secs(2)).await);
        async_app.shutdown().await;

        assert_eq!(eager_log.lock().unwrap().len(), 3);
        assert_eq!(*eager_log.lock().unwrap(), *async_log.lock().unwrap());
    }

    #[tokio::test]
    async fn context_released_for_every_invocation() {
        let contexts = Arc::new(RecordingContexts::default());
        let mut app = AppBuilder::new()
            .context_provider(contexts.clone())
            .register_task::<Ping, _>(PingHandler)
            .unwrap()
            .register(TaskDefinition::new(
                "explode",
                Arc::new(handler_fn(|_args| async {
                    Err::<Value, _>(HandlerError::failed("kaboom"))
                })),
            ))
            .unwrap()
            .build()
            .await
            .unwrap();

        let ok = app.dispatcher().enqueue_task(&Ping {}).await.unwrap();
        let failed = app.dispatcher().enqueue("explode", TaskArgs::new(), None).await.unwrap();
        app.start_workers(2, Vec::new());
        assert!(app.wait_idle(Duration::from_secs(2)).await);
        app.shutdown().await;

        let mut released = contexts.released.lock().unwrap().clone();
        released.sort();
        let mut expected = vec![(ok, true), (failed, false)];
        expected.sort();
        assert_eq!(released, expected);
    }

    #[tokio::test]
    async fn worker_crash_redelivers_message() {
        let app = AppBuilder::new()
            .register_task::<Double, _>(DoubleHandler)
            .unwrap()
            .build()
            .await
            .unwrap();
        app.dispatcher().enqueue_task(&Double { value: 2 }).await.unwrap();

        // a consumer takes the message and dies before settling it
        let delivery = app
            .broker()
            .consume(&app.queues(), Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        drop(delivery);

        let worker = app.worker(Vec::new());
        assert_eq!(worker.process_next().await.unwrap(), Some(Disposition::Ack));
        let stats = app.stats().await;
        assert_eq!(stats[0].1.acked, 1);
    }

    #[tokio::test]
    async fn shutdown_closes_broker() {
        let broker = Arc::new(InMemoryBroker::default());
        let mut app = AppBuilder::new()
            .broker(broker.clone())
            .register_task::<Double, _>(DoubleHandler)
            .unwrap()
            .build()
            .await
            .unwrap();
        app.start_workers(3, Vec::new());
        let pool_size = app.start_workers(1, Vec::new()).len();
        assert_eq!(pool_size, 3);

        app.shutdown().await;

        assert!(broker.is_closed());
    }
}
