//! Typed task API.
//!
//! Two layers:
//! - **Typed**: `Task` and `Handler<T>` bind a task name to an argument type.
//! - **Dyn**: `TaskHandler` is object-safe and lives in the `TaskRegistry`.

pub mod handler;
pub mod registry;
pub mod task;

pub use self::handler::{FnHandler, Handler, TaskHandler, TypedHandler, bind_args, handler_fn};
pub use self::registry::{TaskDefinition, TaskRegistry};
pub use self::task::Task;
