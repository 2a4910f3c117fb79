//! spool-core
//!
//! Background task dispatch and execution: a producer publishes named task
//! invocations to broker queues, workers consume and run them.
//!
//! # Modules
//! - **domain**: ids, task messages, execution context, outcomes, errors
//! - **codec**: message serialization with a content-type allow-list
//! - **ports**: seams for the broker, clock, id generation and context
//!   acquisition
//! - **impls**: in-memory broker
//! - **typed**: `Task` / `Handler` traits and the task registry
//! - **app**: configuration, routing, dispatcher, executor, workers, builder

pub mod app;
pub mod codec;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod typed;

pub use app::{App, AppBuilder, Dispatcher, SpoolConfig};
pub use domain::{QueueName, SpoolError, TaskArgs, TaskName};
pub use typed::{Handler, Task, TaskHandler};
