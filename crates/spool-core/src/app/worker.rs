//! Consumer loop: take a delivery, decode, execute, settle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::codec::Codec;
use crate::domain::{Disposition, InvocationMeta, QueueName, SpoolError, WorkerId};
use crate::ports::{Broker, Delivery};

use super::executor::Executor;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Consumed in order; earlier queues are drained first.
    pub queues: Vec<QueueName>,
    /// How long one `consume` call waits before the loop re-checks shutdown.
    pub poll_timeout: Duration,
    /// Pause after a broker error before consuming again.
    pub error_backoff: Duration,
}

impl WorkerConfig {
    pub fn new(queues: Vec<QueueName>) -> Self {
        Self {
            queues,
            poll_timeout: Duration::from_secs(1),
            error_backoff: Duration::from_millis(500),
        }
    }
}

/// A single consumer. Runs one task at a time: a task finishes, context
/// released and delivery settled, before the next delivery is taken.
pub struct Worker {
    id: WorkerId,
    config: WorkerConfig,
    broker: Arc<dyn Broker>,
    codec: Codec,
    executor: Arc<Executor>,
}

impl Worker {
    pub fn new(config: WorkerConfig, broker: Arc<dyn Broker>, codec: Codec, executor: Arc<Executor>) -> Self {
        Self {
            id: WorkerId::generate(),
            config,
            broker,
            codec,
            executor,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Loop until `shutdown` flips to true, its sender is dropped, or the
    /// broker shuts down. A task already running is allowed to finish.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker_id = %self.id, queues = ?self.config.queues, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                next = self.broker.consume(&self.config.queues, self.config.poll_timeout) => next,
            };

            match next {
                Ok(Some(delivery)) => {
                    self.handle(delivery).await;
                }
                Ok(None) => {}
                Err(SpoolError::Shutdown) => break,
                Err(error) => {
                    tracing::warn!(worker_id = %self.id, error = %error, "consume failed, backing off");
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }
        tracing::info!(worker_id = %self.id, "worker stopped");
    }

    /// Process at most one delivery, waiting up to the poll timeout for it.
    /// Returns how the delivery was settled.
    pub async fn process_next(&self) -> Result<Option<Disposition>, SpoolError> {
        match self
            .broker
            .consume(&self.config.queues, self.config.poll_timeout)
            .await?
        {
            Some(delivery) => Ok(Some(self.handle(delivery).await)),
            None => Ok(None),
        }
    }

    async fn handle(&self, delivery: Box<dyn Delivery>) -> Disposition {
        let disposition = match self.codec.decode(delivery.message()) {
            Ok(message) => {
                let meta = InvocationMeta {
                    message_id: message.id,
                    task_name: message.task_name.clone(),
                    queue: delivery.queue().clone(),
                    worker_id: Some(self.id),
                    delivery_count: delivery.delivery_count(),
                };
                self.executor.execute(&message, meta).await.disposition()
            }
            Err(error) => {
                tracing::error!(
                    worker_id = %self.id,
                    queue = %delivery.queue(),
                    content_type = %delivery.message().content_type,
                    error = %error,
                    "rejecting undecodable message"
                );
                Disposition::DeadLetter
            }
        };

        let queue = delivery.queue().clone();
        if let Err(error) = delivery.settle(disposition).await {
            tracing::error!(worker_id = %self.id, queue = %queue, ?disposition, error = %error, "settle failed");
        }
        disposition
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::codec::{ContentType, EncodedMessage};
    use crate::domain::{FailurePolicy, HandlerError, MessageId, TaskArgs, TaskMessage, TaskName};
    use crate::impls::InMemoryBroker;
    use crate::ports::{BasicContextProvider, QueueStats};
    use crate::typed::{TaskDefinition, TaskRegistry, handler_fn};
    use chrono::Utc;
    use serde_json::{Value, json};

    fn q(name: &str) -> QueueName {
        QueueName::new(name)
    }

    struct Fixture {
        broker: Arc<InMemoryBroker>,
        worker: Worker,
        calls: Arc<AtomicUsize>,
    }

    fn fixture(policy: FailurePolicy) -> Fixture {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = TaskRegistry::new();
        let counter = calls.clone();
        registry
            .register(TaskDefinition::new(
                "count",
                Arc::new(handler_fn(move |_args| {
                    let counter = counter.clone();
                    async move { Ok(json!(counter.fetch_add(1, Ordering::SeqCst) + 1)) }
                })),
            ))
            .unwrap();
        let counter = calls.clone();
        registry
            .register(TaskDefinition::new(
                "explode",
                Arc::new(handler_fn(move |_args| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err::<Value, _>(HandlerError::failed("kaboom"))
                    }
                })),
            ))
            .unwrap();

        let broker = Arc::new(InMemoryBroker::default());
        let executor = Arc::new(Executor::new(
            Arc::new(registry),
            Arc::new(BasicContextProvider),
            policy,
            Disposition::DeadLetter,
        ));
        let mut config = WorkerConfig::new(vec![q("default")]);
        config.poll_timeout = Duration::from_millis(20);
        let worker = Worker::new(config, broker.clone(), Codec::default(), executor);
        Fixture { broker, worker, calls }
    }

    async fn publish(broker: &InMemoryBroker, task: &str) {
        let message = TaskMessage::new(
            MessageId::generate(),
            TaskName::new(task),
            TaskArgs::new(),
            Utc::now(),
            q("default"),
        );
        let encoded = Codec::default().encode(&message).unwrap();
        broker.publish(&q("default"), encoded).await.unwrap();
    }

    async fn stats(broker: &InMemoryBroker) -> QueueStats {
        broker.stats(&q("default")).await.unwrap_or_default()
    }

    #[tokio::test]
    async fn successful_task_is_acked_once() {
        let f = fixture(FailurePolicy::AckAlways);
        publish(&f.broker, "count").await;

        assert_eq!(f.worker.process_next().await.unwrap(), Some(Disposition::Ack));
        assert_eq!(f.worker.process_next().await.unwrap(), None);
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            stats(&f.broker).await,
            QueueStats { ready: 0, unacked: 0, acked: 1, dead_lettered: 0 }
        );
    }

    #[tokio::test]
    async fn malformed_message_is_dead_lettered_and_loop_continues() {
        let f = fixture(FailurePolicy::AckAlways);
        f.broker
            .publish(&q("default"), EncodedMessage::new(ContentType::Json.mime(), b"not json".to_vec()))
            .await
            .unwrap();
        f.broker
            .publish(&q("default"), EncodedMessage::new("application/x-python-serialize", vec![0x80]))
            .await
            .unwrap();
        publish(&f.broker, "count").await;

        assert_eq!(f.worker.process_next().await.unwrap(), Some(Disposition::DeadLetter));
        assert_eq!(f.worker.process_next().await.unwrap(), Some(Disposition::DeadLetter));
        assert_eq!(f.worker.process_next().await.unwrap(), Some(Disposition::Ack));
        assert_eq!(f.broker.dead_letters(&q("default")).len(), 2);
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_task_does_not_stop_the_worker() {
        let f = fixture(FailurePolicy::AckAlways);
        publish(&f.broker, "not_registered_here").await;
        publish(&f.broker, "count").await;

        assert_eq!(f.worker.process_next().await.unwrap(), Some(Disposition::DeadLetter));
        assert_eq!(f.worker.process_next().await.unwrap(), Some(Disposition::Ack));
    }

    #[tokio::test]
    async fn requeue_policy_redelivers_until_limit() {
        let f = fixture(FailurePolicy::Requeue { max_deliveries: 3 });
        publish(&f.broker, "explode").await;

        assert_eq!(f.worker.process_next().await.unwrap(), Some(Disposition::Requeue));
        assert_eq!(f.worker.process_next().await.unwrap(), Some(Disposition::Requeue));
        assert_eq!(f.worker.process_next().await.unwrap(), Some(Disposition::DeadLetter));
        assert_eq!(f.worker.process_next().await.unwrap(), None);
        assert_eq!(f.calls.load(Ordering::SeqCst), 3);
        assert_eq!(stats(&f.broker).await.dead_lettered, 1);
    }

    #[tokio::test]
    async fn default_policy_acks_failed_task() {
        let f = fixture(FailurePolicy::AckAlways);
        publish(&f.broker, "explode").await;

        assert_eq!(f.worker.process_next().await.unwrap(), Some(Disposition::Ack));
        assert_eq!(f.worker.process_next().await.unwrap(), None);
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_drains_then_stops_on_shutdown() {
        let f = fixture(FailurePolicy::AckAlways);
        for _ in 0..5 {
            publish(&f.broker, "count").await;
        }
        let (tx, rx) = watch::channel(false);
        let worker = Arc::new(f.worker);

        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run(rx).await }
        });

        tokio::time::timeout(Duration::from_secs(2), async {
            while f.calls.load(Ordering::SeqCst) < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats(&f.broker).await.acked, 5);
    }

    #[tokio::test]
    async fn run_stops_when_broker_closes() {
        let f = fixture(FailurePolicy::AckAlways);
        let (_tx, rx) = watch::channel(false);
        let broker = f.broker.clone();
        let handle = tokio::spawn(async move { f.worker.run(rx).await });

        broker.close().await;

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
