//! Handlers: the typed surface and its object-safe form.
//!
//! A message carries arguments as JSON, either a positional list or a keyword
//! map. [`bind_args`] turns them into the task's parameter struct:
//!
//! - keyword arguments bind by field name, so extra or missing keys surface
//!   as `InvalidArguments` from serde;
//! - positional arguments bind by declaration order, the way serde reads a
//!   struct from a sequence;
//! - no arguments at all bind as an empty map, which is why a task without
//!   parameters is written `struct Ping {}` and not `struct Ping;`.
//!
//! Supplying both forms at once is an error. Serde cannot merge a sequence
//! into a map, and any merge rule picked here would silently disagree with
//! the producer about which value wins.
//!
//! [`TypedHandler`] erases the task type so the registry can hold every
//! handler as `Arc<dyn TaskHandler>` and the worker never sees `T`.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::task::Task;
use crate::domain::{ExecutionContext, HandlerError, TaskArgs};

/// Object-safe handler stored in the registry.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn call(&self, ctx: &ExecutionContext, args: TaskArgs) -> Result<Value, HandlerError>;
}

/// Handler for one typed task.
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    type Output: Serialize + Send + 'static;

    async fn handle(&self, ctx: &ExecutionContext, task: T) -> Result<Self::Output, HandlerError>;
}

/// Erases `Handler<T>` into a `TaskHandler`, binding arguments to `T`.
pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> TaskHandler for TypedHandler<T, H> {
    async fn call(&self, ctx: &ExecutionContext, args: TaskArgs) -> Result<Value, HandlerError> {
        let task: T = bind_args(args)?;
        let output = self.handler.handle(ctx, task).await?;
        serde_json::to_value(output)
            .map_err(|e| HandlerError::failed(format!("output encode: {e}")))
    }
}

/// Bind invocation arguments to a deserializable parameter type.
///
/// Keyword arguments bind by field name, positional arguments by field
/// order. Mixing both is rejected rather than guessed at.
pub fn bind_args<T: DeserializeOwned>(args: TaskArgs) -> Result<T, HandlerError> {
    let value = match (args.args.is_empty(), args.kwargs.is_empty()) {
        (false, false) => {
            return Err(HandlerError::InvalidArguments(
                "pass either positional or keyword arguments, not both".into(),
            ));
        }
        (false, true) => Value::Array(args.args),
        (true, _) => Value::Object(args.kwargs),
    };
    serde_json::from_value(value).map_err(|e| HandlerError::InvalidArguments(e.to_string()))
}

/// Handler built from an async closure over the raw arguments.
pub struct FnHandler<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TaskArgs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskArgs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn call(&self, _ctx: &ExecutionContext, args: TaskArgs) -> Result<Value, HandlerError> {
        (self.f)(args).await
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::typed::task::fixtures::{Double, Ping};

    pub struct DoubleHandler;

    #[async_trait]
    impl Handler<Double> for DoubleHandler {
        type Output = i64;

        async fn handle(&self, _ctx: &ExecutionContext, task: Double) -> Result<i64, HandlerError> {
            Ok(task.value * 2)
        }
    }

    pub struct PingHandler;

    #[async_trait]
    impl Handler<Ping> for PingHandler {
        type Output = &'static str;

        async fn handle(&self, _ctx: &ExecutionContext, _task: Ping) -> Result<&'static str, HandlerError> {
            Ok("pong")
        }
    }
}
