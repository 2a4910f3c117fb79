//! Runs one decoded task message: handler lookup, context scope, invocation,
//! outcome mapping. Shared by workers and the eager dispatch path.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tracing::Instrument;

use crate::domain::{
    Disposition, ExecutionResult, FailurePolicy, HandlerError, InvocationMeta, TaskMessage,
};
use crate::ports::ContextProvider;
use crate::typed::TaskRegistry;

pub struct Executor {
    registry: Arc<TaskRegistry>,
    contexts: Arc<dyn ContextProvider>,
    failure_policy: FailurePolicy,
    unknown_task_policy: Disposition,
}

impl Executor {
    pub fn new(
        registry: Arc<TaskRegistry>,
        contexts: Arc<dyn ContextProvider>,
        failure_policy: FailurePolicy,
        unknown_task_policy: Disposition,
    ) -> Self {
        Self {
            registry,
            contexts,
            failure_policy,
            unknown_task_policy,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Never returns an error: every outcome, including a panic inside the
    /// handler, becomes an [`ExecutionResult`] with a disposition.
    pub async fn execute(&self, message: &TaskMessage, meta: InvocationMeta) -> ExecutionResult {
        let Some(definition) = self.registry.get(&message.task_name) else {
            tracing::error!(
                task = %message.task_name,
                message_id = %message.id,
                queue = %meta.queue,
                disposition = ?self.unknown_task_policy,
                "received unregistered task"
            );
            return ExecutionResult::UnknownTask {
                disposition: self.unknown_task_policy,
            };
        };

        let span = tracing::info_span!(
            "task",
            task = %message.task_name,
            message_id = %message.id,
            queue = %meta.queue,
            delivery = meta.delivery_count,
            eager = meta.is_eager(),
        );

        async move {
            tracing::info!(args = ?message.args, kwargs = ?message.kwargs, "task received");
            let delivery_count = meta.delivery_count;

            let ctx = match self.contexts.acquire(meta).await {
                Ok(ctx) => ctx,
                Err(error) => return self.failed(message, error, delivery_count),
            };

            let started = Instant::now();
            let outcome = AssertUnwindSafe(definition.handler().call(&ctx, message.arguments()))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(HandlerError::Panicked(panic_message(&*payload))));

            self.contexts.release(ctx, outcome.is_ok()).await;

            match outcome {
                Ok(output) => {
                    tracing::info!(
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "task succeeded"
                    );
                    ExecutionResult::Completed { output }
                }
                Err(error) => self.failed(message, error, delivery_count),
            }
        }
        .instrument(span)
        .await
    }

    fn failed(&self, message: &TaskMessage, error: HandlerError, delivery_count: u32) -> ExecutionResult {
        let disposition = self.failure_policy.decide(delivery_count);
        tracing::error!(
            task = %message.task_name,
            message_id = %message.id,
            args = ?message.args,
            kwargs = ?message.kwargs,
            error = %error,
            ?disposition,
            "task failed"
        );
        ExecutionResult::Failed { error, disposition }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
