//! Domain model: ids, task messages, execution context, errors, outcomes.

pub mod context;
pub mod errors;
pub mod ids;
pub mod outcome;
pub mod task;

pub use context::{ExecutionContext, InvocationMeta};
pub use errors::{HandlerError, SpoolError};
pub use ids::{Id, IdMarker, MessageId, WorkerId};
pub use outcome::{Disposition, ExecutionResult, FailurePolicy};
pub use task::{QueueName, TaskArgs, TaskMessage, TaskName};
