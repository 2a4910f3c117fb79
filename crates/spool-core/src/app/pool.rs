use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::codec::Codec;
use crate::domain::WorkerId;
use crate::ports::Broker;

use super::executor::Executor;
use super::worker::{Worker, WorkerConfig};

/// Handle over `n` independent workers consuming the same queues.
/// - dropping the pool (or `request_shutdown`) stops every worker from taking
///   new deliveries
/// - `shutdown_and_join` also waits for in-flight tasks to finish
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    worker_ids: Vec<WorkerId>,
}

impl WorkerPool {
    pub fn spawn(
        n: usize,
        config: WorkerConfig,
        broker: Arc<dyn Broker>,
        codec: Codec,
        executor: Arc<Executor>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        let mut worker_ids = Vec::with_capacity(n);
        for _ in 0..n {
            let worker = Worker::new(
                config.clone(),
                Arc::clone(&broker),
                codec.clone(),
                Arc::clone(&executor),
            );
            worker_ids.push(worker.id());
            let rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move { worker.run(rx).await }));
        }

        tracing::info!(workers = n, queues = ?config.queues, "worker pool started");
        Self {
            shutdown_tx,
            joins,
            worker_ids,
        }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    pub fn worker_ids(&self) -> &[WorkerId] {
        &self.worker_ids
    }

    /// Stop taking new deliveries. Running handlers are not cancelled.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(error) = join.await {
                tracing::error!(error = %error, "worker task ended abnormally");
            }
        }
        tracing::info!("worker pool stopped");
    }
}
