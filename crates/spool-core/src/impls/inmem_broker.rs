//! In-process broker.
//!
//! Queues live in a `std::sync::Mutex` that is never held across an await,
//! so an unsettled delivery can put its message back from `Drop`. Waiting
//! consumers are woken through a `Notify` registered before the queues are
//! inspected, which closes the gap between "found nothing" and "started
//! waiting".

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::codec::EncodedMessage;
use crate::domain::{Disposition, QueueName, SpoolError};
use crate::ports::{Broker, Delivery, QueueStats};

#[derive(Debug, Clone)]
struct StoredMessage {
    message: EncodedMessage,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, StoredMessage>,
    acked: usize,
    dead_letters: Vec<EncodedMessage>,
}

impl QueueState {
    fn stats(&self) -> QueueStats {
        QueueStats {
            ready: self.ready.len(),
            unacked: self.unacked.len(),
            acked: self.acked,
            dead_lettered: self.dead_letters.len(),
        }
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<QueueName, QueueState>,
    closed: bool,
    next_tag: u64,
}

struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move an in-flight message out of `unacked` according to `disposition`.
    fn settle(&self, queue: &QueueName, tag: u64, disposition: Disposition) {
        let requeued = {
            let mut state = self.lock();
            let Some(q) = state.queues.get_mut(queue) else {
                return;
            };
            let Some(stored) = q.unacked.remove(&tag) else {
                return;
            };
            match disposition {
                Disposition::Ack => {
                    q.acked += 1;
                    false
                }
                Disposition::Requeue => {
                    q.ready.push_back(stored);
                    true
                }
                Disposition::DeadLetter => {
                    q.dead_letters.push(stored.message);
                    false
                }
            }
        };
        if requeued {
            self.notify.notify_waiters();
        }
    }
}

/// Broker holding every queue in process memory.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
    create_missing_queues: bool,
}

impl InMemoryBroker {
    pub fn new(create_missing_queues: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
            }),
            create_missing_queues,
        }
    }

    /// Messages parked on `queue` after being dead-lettered.
    pub fn dead_letters(&self, queue: &QueueName) -> Vec<EncodedMessage> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.dead_letters.clone())
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Resolve `queue`, creating it when the policy allows.
    fn queue_mut<'a>(
        &self,
        state: &'a mut BrokerState,
        queue: &QueueName,
    ) -> Result<&'a mut QueueState, SpoolError> {
        if !self.create_missing_queues && !state.queues.contains_key(queue) {
            return Err(SpoolError::UnknownQueue(queue.clone()));
        }
        Ok(state.queues.entry(queue.clone()).or_default())
    }

    fn try_take(&self, queues: &[QueueName]) -> Result<Option<Box<dyn Delivery>>, SpoolError> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(SpoolError::Shutdown);
        }

        for queue in queues {
            self.queue_mut(&mut state, queue)?;
        }

        let tag = state.next_tag;
        for queue in queues {
            let Some(q) = state.queues.get_mut(queue) else {
                continue;
            };
            let Some(mut stored) = q.ready.pop_front() else {
                continue;
            };
            stored.delivery_count += 1;
            let delivery = InMemoryDelivery {
                tag,
                queue: queue.clone(),
                message: stored.message.clone(),
                delivery_count: stored.delivery_count,
                shared: Arc::clone(&self.shared),
                settled: false,
            };
            q.unacked.insert(tag, stored);
            state.next_tag += 1;
            return Ok(Some(Box::new(delivery)));
        }
        Ok(None)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_queue(&self, queue: &QueueName) -> Result<(), SpoolError> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(SpoolError::BrokerUnavailable("broker is closed".into()));
        }
        state.queues.entry(queue.clone()).or_default();
        Ok(())
    }

    async fn queue_exists(&self, queue: &QueueName) -> bool {
        self.shared.lock().queues.contains_key(queue)
    }

    async fn publish(&self, queue: &QueueName, message: EncodedMessage) -> Result<(), SpoolError> {
        {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(SpoolError::BrokerUnavailable("broker is closed".into()));
            }
            let q = self.queue_mut(&mut state, queue)?;
            q.ready.push_back(StoredMessage {
                message,
                delivery_count: 0,
            });
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn consume(
        &self,
        queues: &[QueueName],
        timeout: Duration,
    ) -> Result<Option<Box<dyn Delivery>>, SpoolError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take(queues)? {
                return Ok(Some(delivery));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn stats(&self, queue: &QueueName) -> Option<QueueStats> {
        self.shared.lock().queues.get(queue).map(QueueState::stats)
    }

    async fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.notify.notify_waiters();
    }
}

struct InMemoryDelivery {
    tag: u64,
    queue: QueueName,
    message: EncodedMessage,
    delivery_count: u32,
    shared: Arc<Shared>,
    settled: bool,
}

#[async_trait]
impl Delivery for InMemoryDelivery {
    fn message(&self) -> &EncodedMessage {
        &self.message
    }

    fn queue(&self) -> &QueueName {
        &self.queue
    }

    fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    async fn settle(self: Box<Self>, disposition: Disposition) -> Result<(), SpoolError> {
        let mut this = self;
        this.settled = true;
        this.shared.settle(&this.queue, this.tag, disposition);
        Ok(())
    }
}

impl Drop for InMemoryDelivery {
    fn drop(&mut self) {
        if !self.settled {
            self.shared.settle(&self.queue, self.tag, Disposition::Requeue);
        }
    }
}
