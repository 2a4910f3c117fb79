//! Error taxonomy for dispatch and execution.

use thiserror::Error;

use super::task::{QueueName, TaskName};

/// Errors raised by the dispatch and consume paths.
#[derive(Debug, Error)]
pub enum SpoolError {
    /// The broker could not be reached, or publishing did not complete in time.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("unknown task: {0}")]
    UnknownTask(TaskName),

    /// Publishing to an undeclared queue while lazy queue creation is off.
    #[error("unknown queue: {0}")]
    UnknownQueue(QueueName),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Content type outside the accept list.
    #[error("content type '{0}' is not accepted")]
    UnsupportedContentType(String),

    #[error("task {task} failed: {source}")]
    HandlerFailure {
        task: TaskName,
        #[source]
        source: HandlerError,
    },

    #[error("task {0} is already registered")]
    DuplicateTask(TaskName),

    /// The broker was closed; consumers should stop.
    #[error("broker is shut down")]
    Shutdown,
}

impl SpoolError {
    /// Worth another publish attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, SpoolError::BrokerUnavailable(_))
    }
}

/// Failure raised from inside task logic.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Arguments did not bind to the handler's parameters.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Failed(String),

    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The execution context could not be established.
    #[error("execution context unavailable: {0}")]
    Context(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}
