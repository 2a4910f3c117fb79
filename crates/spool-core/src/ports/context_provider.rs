//! ContextProvider port: scoped acquisition and release of handler resources.

use async_trait::async_trait;

use crate::domain::{ExecutionContext, HandlerError, InvocationMeta};

/// Builds the execution context for each invocation and tears it down.
///
/// `release` is called exactly once for every context `acquire` returned,
/// whether the handler succeeded, failed or panicked.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn acquire(&self, meta: InvocationMeta) -> Result<ExecutionContext, HandlerError>;

    async fn release(&self, ctx: ExecutionContext, succeeded: bool);
}

/// Context carrying invocation metadata only.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicContextProvider;

#[async_trait]
impl ContextProvider for BasicContextProvider {
    async fn acquire(&self, meta: InvocationMeta) -> Result<ExecutionContext, HandlerError> {
        Ok(ExecutionContext::new(meta))
    }

    async fn release(&self, _ctx: ExecutionContext, _succeeded: bool) {}
}
