//! Reference tasks served by the `spool` binary.

use async_trait::async_trait;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use spool_core::app::{AppBuilder, SpoolConfig};
use spool_core::domain::{ExecutionContext, HandlerError, SpoolError};
use spool_core::typed::{Handler, Task};

/// Doubles a number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compute {
    pub random_number: i64,
    pub now_timestamp: String,
}

impl Task for Compute {
    const NAME: &'static str = "compute";
    const QUEUE: Option<&'static str> = Some("compute");
}

pub struct ComputeHandler;

#[async_trait]
impl Handler<Compute> for ComputeHandler {
    type Output = i64;

    async fn handle(&self, ctx: &ExecutionContext, task: Compute) -> Result<i64, HandlerError> {
        tracing::info!(
            message_id = %ctx.meta().message_id,
            random_number = task.random_number,
            now_timestamp = %task.now_timestamp,
            "compute received"
        );
        let result = task
            .random_number
            .checked_mul(2)
            .ok_or_else(|| HandlerError::failed(format!("{} doubled overflows", task.random_number)))?;
        tracing::info!(message_id = %ctx.meta().message_id, result, "compute finished");
        Ok(result)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRandomString {}

impl Task for GenerateRandomString {
    const NAME: &'static str = "generate_random_string";
    const QUEUE: Option<&'static str> = Some("generate_random_string");
}

pub struct GenerateRandomStringHandler;

#[async_trait]
impl Handler<GenerateRandomString> for GenerateRandomStringHandler {
    type Output = String;

    async fn handle(&self, ctx: &ExecutionContext, _task: GenerateRandomString) -> Result<String, HandlerError> {
        let value = random_string();
        tracing::info!(message_id = %ctx.meta().message_id, len = value.len(), "random string generated");
        Ok(value)
    }
}

/// 10 to 20 ASCII letters and digits.
fn random_string() -> String {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(10..=20);
    (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub const NAMES: &[&str] = &[Compute::NAME, GenerateRandomString::NAME];

pub fn register(builder: AppBuilder) -> Result<AppBuilder, SpoolError> {
    Ok(builder
        .register_task::<Compute, _>(ComputeHandler)?
        .register_task::<GenerateRandomString, _>(GenerateRandomStringHandler)?
        .expect_tasks(NAMES))
}

/// Each reference task gets a queue of its own name unless routed elsewhere.
pub fn default_routes(config: &mut SpoolConfig) {
    config.route_default(Compute::NAME, "compute");
    config.route_default(GenerateRandomString::NAME, "generate_random_string");
}
