//! Producer side: turn a task request into a message on a queue.
//!
//! Every request is validated against the local registry, routed, stamped
//! with a fresh id and encoded with the configured serializer. Then one of
//! two things happens.
//!
//! In async mode the encoded bytes are published. Each attempt runs under
//! the publish timeout and only `BrokerUnavailable` is retried, with backoff.
//! A missing queue is a configuration fault and surfaces at once.
//!
//! In eager mode the same bytes are decoded again and handed to the shared
//! [`Executor`] in the caller's task. Encoding first means a payload that
//! would not survive the broker fails eagerly too, and the queue check below
//! means a queue the broker would refuse is refused here as well. Handler
//! failures are logged, not returned, as a worker would.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::codec::{Codec, EncodedMessage};
use crate::domain::{InvocationMeta, MessageId, QueueName, SpoolError, TaskArgs, TaskMessage, TaskName};
use crate::ports::{Broker, Clock, IdGenerator, SystemClock, UlidGenerator};
use crate::typed::Task;

use super::config::{PublishConfig, SpoolConfig};
use super::executor::Executor;
use super::routing::Router;

/// Body returned to a caller once a task is on its way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Acknowledgement {
    pub message: String,
    #[serde(skip_serializing)]
    pub message_id: MessageId,
}

impl Acknowledgement {
    pub const SENT: &'static str = "Successfully sent to queue.";

    pub fn sent(message_id: MessageId) -> Self {
        Self {
            message: Self::SENT.to_string(),
            message_id,
        }
    }
}

/// Publishes task messages. Never waits for execution, except in eager mode
/// where the task runs in the caller before `enqueue` returns.
pub struct Dispatcher {
    router: Router,
    broker: Arc<dyn Broker>,
    codec: Codec,
    executor: Arc<Executor>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    publish: PublishConfig,
    eager: bool,
    validate_tasks: bool,
    create_missing_queues: bool,
}

impl Dispatcher {
    pub fn new(config: &SpoolConfig, broker: Arc<dyn Broker>, executor: Arc<Executor>) -> Self {
        Self {
            router: config.router(),
            broker,
            codec: config.codec(),
            executor,
            ids: Arc::new(UlidGenerator::new(SystemClock)),
            clock: Arc::new(SystemClock),
            publish: config.publish.clone(),
            eager: config.eager,
            validate_tasks: config.validate_tasks,
            create_missing_queues: config.create_missing_queues,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn is_eager(&self) -> bool {
        self.eager
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Publish `task_name` with `args` to its resolved queue.
    ///
    /// `routing_override` wins over every configured route.
    pub async fn enqueue(
        &self,
        task_name: impl Into<TaskName>,
        args: TaskArgs,
        routing_override: Option<QueueName>,
    ) -> Result<MessageId, SpoolError> {
        self.dispatch(task_name.into(), args, None, routing_override).await
    }

    /// Publish a typed task; its fields become keyword arguments.
    pub async fn enqueue_task<T: Task>(&self, task: &T) -> Result<MessageId, SpoolError> {
        let args = match serde_json::to_value(task) {
            Ok(Value::Object(kwargs)) => TaskArgs::keyword(kwargs),
            Ok(Value::Array(args)) => TaskArgs::positional(args),
            Ok(other) => {
                return Err(SpoolError::MalformedMessage(format!(
                    "task {} must serialize to an object or array, got {other}",
                    T::NAME
                )));
            }
            Err(e) => return Err(SpoolError::MalformedMessage(format!("task {}: {e}", T::NAME))),
        };
        let declared = T::QUEUE.map(QueueName::new);
        self.dispatch(TaskName::new(T::NAME), args, declared, None).await
    }

    /// Fire-and-forget with keyword arguments, answering with the
    /// acknowledgement a caller hands back to its client.
    pub async fn submit(
        &self,
        task_name: impl Into<TaskName>,
        kwargs: Map<String, Value>,
    ) -> Result<Acknowledgement, SpoolError> {
        let id = self.enqueue(task_name, TaskArgs::keyword(kwargs), None).await?;
        Ok(Acknowledgement::sent(id))
    }

    async fn dispatch(
        &self,
        task_name: TaskName,
        args: TaskArgs,
        declared: Option<QueueName>,
        routing_override: Option<QueueName>,
    ) -> Result<MessageId, SpoolError> {
        let definition = self.executor.registry().get(&task_name);
        if definition.is_none() && self.validate_tasks {
            return Err(SpoolError::UnknownTask(task_name));
        }
        let declared = definition.and_then(|d| d.queue()).or(declared.as_ref());
        let queue = self
            .router
            .resolve(&task_name, declared, routing_override.as_ref());

        let message = TaskMessage::new(
            self.ids.generate_message_id(),
            task_name,
            args,
            self.clock.now(),
            queue.clone(),
        );
        let encoded = self.codec.encode(&message)?;

        if self.eager {
            self.run_eager(&queue, &encoded).await?;
        } else {
            self.publish_with_retry(&queue, encoded).await?;
            tracing::info!(
                task = %message.task_name,
                message_id = %message.id,
                queue = %queue,
                "task enqueued"
            );
        }
        Ok(message.id)
    }

    /// Same decode and execution path a worker takes, minus the broker. A
    /// queue the broker would refuse is refused here too.
    async fn run_eager(&self, queue: &QueueName, encoded: &EncodedMessage) -> Result<(), SpoolError> {
        if !self.create_missing_queues && !self.broker.queue_exists(queue).await {
            return Err(SpoolError::UnknownQueue(queue.clone()));
        }
        let message = self.codec.decode(encoded)?;
        let meta = InvocationMeta {
            message_id: message.id,
            task_name: message.task_name.clone(),
            queue: queue.clone(),
            worker_id: None,
            delivery_count: 1,
        };
        let result = self.executor.execute(&message, meta).await;
        tracing::debug!(
            task = %message.task_name,
            message_id = %message.id,
            success = result.is_success(),
            "eager task finished"
        );
        Ok(())
    }

    async fn publish_with_retry(&self, queue: &QueueName, encoded: EncodedMessage) -> Result<(), SpoolError> {
        let mut attempt: u32 = 1;
        loop {
            let published =
                match tokio::time::timeout(self.publish.timeout, self.broker.publish(queue, encoded.clone())).await {
                    Ok(result) => result,
                    Err(_) => Err(SpoolError::BrokerUnavailable(format!(
                        "publish to {queue} timed out after {:?}",
                        self.publish.timeout
                    ))),
                };

            match published {
                Ok(()) => return Ok(()),
                Err(error) if error.is_transient() && attempt < self.publish.max_attempts => {
                    let delay = self.publish.retry.next_delay(attempt);
                    tracing::warn!(
                        queue = %queue,
                        attempt,
                        max_attempts = self.publish.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    tracing::error!(queue = %queue, attempt, error = %error, "publish failed");
                    return Err(error);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::codec::EncodedMessage;
    use crate::domain::{QueueName, SpoolError};
    use crate::impls::InMemoryBroker;
    use crate::ports::{Broker, Delivery, QueueStats};

    /// In-memory broker whose publishes fail or hang on demand.
    pub struct FlakyBroker {
        pub inner: InMemoryBroker,
        pub failures_left: AtomicU32,
        pub hang: bool,
        pub attempts: AtomicU32,
    }

    impl FlakyBroker {
        pub fn failing(times: u32) -> Self {
            Self {
                inner: InMemoryBroker::new(true),
                failures_left: AtomicU32::new(times),
                hang: false,
                attempts: AtomicU32::new(0),
            }
        }

        pub fn hanging() -> Self {
            Self {
                hang: true,
                ..Self::failing(0)
            }
        }

        pub fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Broker for FlakyBroker {
        async fn declare_queue(&self, queue: &QueueName) -> Result<(), SpoolError> {
            self.inner.declare_queue(queue).await
        }

        async fn queue_exists(&self, queue: &QueueName) -> bool {
            self.inner.queue_exists(queue).await
        }

        async fn publish(&self, queue: &QueueName, message: EncodedMessage) -> Result<(), SpoolError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(SpoolError::BrokerUnavailable("connection refused".into()));
            }
            self.inner.publish(queue, message).await
        }

        async fn consume(
            &self,
            queues: &[QueueName],
            timeout: Duration,
        ) -> Result<Option<Box<dyn Delivery>>, SpoolError> {
            self.inner.consume(queues, timeout).await
        }

        async fn stats(&self, queue: &QueueName) -> Option<QueueStats> {
            self.inner.stats(queue).await
        }

        async fn close(&self) {
            self.inner.close().await
        }
    }
}
