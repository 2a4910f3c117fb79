//! Application layer: configuration, dispatch, execution and the worker
//! runtime, wired together by [`AppBuilder`].
//!
//! - **AppBuilder / App**: explicit init and teardown of process-wide state
//! - **Dispatcher**: producer side, async or eager
//! - **Executor**: one invocation inside its execution context
//! - **Worker / WorkerPool**: consume, execute, settle

pub mod builder;
pub mod config;
pub mod dispatcher;
pub mod executor;
pub mod pool;
pub mod retry;
pub mod routing;
pub mod worker;

pub use self::builder::{App, AppBuilder, BuildError};
pub use self::config::{BrokerConfig, ConfigError, LogConfig, PublishConfig, SpoolConfig};
pub use self::dispatcher::{Acknowledgement, Dispatcher};
pub use self::executor::Executor;
pub use self::pool::WorkerPool;
pub use self::retry::RetryPolicy;
pub use self::routing::Router;
pub use self::worker::{Worker, WorkerConfig};
