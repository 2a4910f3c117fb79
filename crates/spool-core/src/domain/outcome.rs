//! Execution outcomes and what happens to a message afterwards.

use std::str::FromStr;

use serde_json::Value;

use super::errors::HandlerError;

/// How a delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove from the queue permanently.
    Ack,
    /// Put back at the tail of its queue for another worker.
    Requeue,
    /// Remove from the queue and park it with the dead letters.
    DeadLetter,
}

/// What to do with a message whose handler failed.
///
/// This is a pure decision on the delivery count; the worker carries it out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Log the failure and remove the message.
    #[default]
    AckAlways,
    /// Requeue until the message has been delivered `max_deliveries` times,
    /// then dead-letter it.
    Requeue { max_deliveries: u32 },
    /// Dead-letter on the first failure.
    DeadLetter,
}

impl FailurePolicy {
    pub fn decide(&self, delivery_count: u32) -> Disposition {
        match *self {
            FailurePolicy::AckAlways => Disposition::Ack,
            FailurePolicy::DeadLetter => Disposition::DeadLetter,
            FailurePolicy::Requeue { max_deliveries } => {
                if delivery_count >= max_deliveries {
                    Disposition::DeadLetter
                } else {
                    Disposition::Requeue
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid failure policy '{0}': expected ack, dead_letter or requeue:<n>")]
pub struct ParsePolicyError(String);

impl FromStr for FailurePolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "ack" => Ok(FailurePolicy::AckAlways),
            "dead_letter" => Ok(FailurePolicy::DeadLetter),
            _ => {
                let max_deliveries = s
                    .strip_prefix("requeue:")
                    .and_then(|n| n.parse::<u32>().ok())
                    .filter(|n| *n > 0)
                    .ok_or_else(|| ParsePolicyError(s.to_string()))?;
                Ok(FailurePolicy::Requeue { max_deliveries })
            }
        }
    }
}

/// Result of running one task message.
#[derive(Debug)]
pub enum ExecutionResult {
    /// Handler returned normally.
    Completed { output: Value },
    /// Handler returned an error, panicked, or its context could not be built.
    Failed {
        error: HandlerError,
        disposition: Disposition,
    },
    /// No handler registered for the task name in this process.
    UnknownTask { disposition: Disposition },
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Completed { .. })
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            ExecutionResult::Completed { .. } => Disposition::Ack,
            ExecutionResult::Failed { disposition, .. } => *disposition,
            ExecutionResult::UnknownTask { disposition } => *disposition,
        }
    }
}
