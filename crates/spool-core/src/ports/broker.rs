//! Broker port: durable named queues of encoded task messages.
//!
//! A consumed [`Delivery`] is owned by exactly one worker until it is
//! settled. `settle` takes `self: Box<Self>`, so a delivery cannot be acked
//! twice. One that is dropped unsettled goes back to its queue with a higher
//! delivery count.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::codec::EncodedMessage;
use crate::domain::{Disposition, QueueName, SpoolError};

/// A message handed to one consumer.
///
/// The consumer owns the delivery and settles it exactly once. A delivery
/// dropped without being settled goes back to its queue, the same way a
/// broker redelivers when a worker dies mid-task.
#[async_trait]
pub trait Delivery: Send {
    fn message(&self) -> &EncodedMessage;

    fn queue(&self) -> &QueueName;

    /// 1 on first delivery, incremented on every redelivery.
    fn delivery_count(&self) -> u32;

    async fn settle(self: Box<Self>, disposition: Disposition) -> Result<(), SpoolError>;
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn declare_queue(&self, queue: &QueueName) -> Result<(), SpoolError>;

    async fn queue_exists(&self, queue: &QueueName) -> bool;

    /// Store a message durably on `queue`.
    ///
    /// Fails with `UnknownQueue` when the queue was never declared and the
    /// broker does not create queues on demand.
    async fn publish(&self, queue: &QueueName, message: EncodedMessage) -> Result<(), SpoolError>;

    /// Take the next ready message from any of `queues`, waiting up to
    /// `timeout`. Queues are tried in the given order.
    async fn consume(
        &self,
        queues: &[QueueName],
        timeout: Duration,
    ) -> Result<Option<Box<dyn Delivery>>, SpoolError>;

    async fn stats(&self, queue: &QueueName) -> Option<QueueStats>;

    /// Refuse further publishes and wake every waiting consumer.
    async fn close(&self);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub ready: usize,
    pub unacked: usize,
    pub acked: usize,
    pub dead_lettered: usize,
}
