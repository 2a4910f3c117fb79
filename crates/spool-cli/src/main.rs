//! spool - run and inspect background tasks.

mod logging;
mod tasks;

use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use rand::Rng;
use serde_json::{Map, Value, json};
use spool_core::app::{Acknowledgement, App, AppBuilder, ConfigError, SpoolConfig};
use spool_core::domain::{QueueName, TaskArgs, TaskName};
use spool_core::typed::Task;

use crate::tasks::{Compute, GenerateRandomString};

#[derive(Parser, Debug)]
#[command(name = "spool")]
#[command(about = "Background task dispatch and workers", long_about = None)]
struct Cli {
    /// Load environment variables from this file instead of ./.env
    #[arg(long, global = true)]
    env_file: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an in-process broker and worker pool over a batch of reference tasks
    Demo {
        /// Number of workers
        #[arg(short, long, default_value_t = 2)]
        workers: usize,

        /// compute tasks to submit
        #[arg(short, long, default_value_t = 5)]
        count: usize,
    },

    /// Run one task eagerly in this process
    Call {
        /// Task name, e.g. compute
        task: String,

        /// Keyword arguments as a JSON object
        #[arg(long)]
        kwargs: Option<String>,

        /// Positional arguments as a JSON array
        #[arg(long)]
        args: Option<String>,

        /// Publish to this queue instead of the routed one
        #[arg(long)]
        queue: Option<String>,
    },

    /// Print the resolved configuration (password redacted)
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.env_file {
        Some(path) => {
            dotenvy::from_path(path).with_context(|| format!("failed to load {}", path.display()))?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    match cli.command {
        Commands::Demo { workers, count } => {
            let config = load_config(false)?;
            logging::init(&config.log)?;
            demo(config, workers, count).await
        }
        Commands::Call {
            task,
            kwargs,
            args,
            queue,
        } => {
            let mut config = load_config(false)?;
            config.eager = true;
            logging::init(&config.log)?;
            let args = parse_args(args.as_deref(), kwargs.as_deref())?;
            call(config, task, args, queue.map(QueueName::new)).await
        }
        Commands::Config => {
            let config = load_config(true)?;
            println!("{}", serde_json::to_string_pretty(&describe(&config))?);
            Ok(())
        }
    }
}

/// Read the environment; unless `strict`, fall back to local defaults when
/// required variables are absent.
fn load_config(strict: bool) -> anyhow::Result<SpoolConfig> {
    let mut config = match SpoolConfig::from_env() {
        Ok(config) => config,
        Err(ConfigError::Missing(key)) if !strict => {
            eprintln!("{key} not set, using local defaults");
            SpoolConfig::local("default")
        }
        Err(e) => return Err(e.into()),
    };
    tasks::default_routes(&mut config);
    Ok(config)
}

async fn build_app(config: SpoolConfig) -> anyhow::Result<App> {
    let app = tasks::register(AppBuilder::new().config(config))?
        .build()
        .await
        .context("failed to build app")?;
    Ok(app)
}

async fn demo(config: SpoolConfig, workers: usize, count: usize) -> anyhow::Result<()> {
    let mut app = build_app(config).await?;
    let eager = app.dispatcher().is_eager();

    for _ in 0..count {
        let task = Compute {
            random_number: rand::thread_rng().gen_range(0..=10_000),
            now_timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let id = app.dispatcher().enqueue_task(&task).await?;
        tracing::debug!(message_id = %id, random_number = task.random_number, "submitted");
    }
    app.dispatcher().enqueue_task(&GenerateRandomString {}).await?;

    if !eager {
        app.start_workers(workers, Vec::new());
        tokio::select! {
            idle = app.wait_idle(Duration::from_secs(30)) => {
                if !idle {
                    tracing::warn!("queues did not drain within 30s");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
            }
        }
    }

    for (queue, stats) in app.stats().await {
        println!("{queue}: {}", serde_json::to_string(&stats)?);
    }
    app.shutdown().await;
    Ok(())
}

async fn call(
    config: SpoolConfig,
    task: String,
    args: TaskArgs,
    queue: Option<QueueName>,
) -> anyhow::Result<()> {
    let app = build_app(config).await?;
    let task = TaskName::new(task);
    if !app.registry().contains(&task) {
        bail!(
            "unknown task '{task}', registered: {}",
            tasks::NAMES.join(", ")
        );
    }
    let id = app.dispatcher().enqueue(task, args, queue).await?;
    println!("{}", serde_json::to_string(&Acknowledgement::sent(id))?);
    app.shutdown().await;
    Ok(())
}

fn parse_args(args: Option<&str>, kwargs: Option<&str>) -> anyhow::Result<TaskArgs> {
    let mut parsed = TaskArgs::new();
    if let Some(raw) = args {
        match serde_json::from_str(raw).context("--args is not valid JSON")? {
            Value::Array(values) => parsed.args = values,
            other => bail!("--args must be a JSON array, got {other}"),
        }
    }
    if let Some(raw) = kwargs {
        match serde_json::from_str(raw).context("--kwargs is not valid JSON")? {
            Value::Object(map) => parsed.kwargs = map,
            other => bail!("--kwargs must be a JSON object, got {other}"),
        }
    }
    Ok(parsed)
}

fn describe(config: &SpoolConfig) -> Value {
    let mut routes: Vec<(String, String)> = config
        .routes
        .iter()
        .map(|(task, queue)| (task.to_string(), queue.to_string()))
        .collect();
    routes.sort();
    let routes: Map<String, Value> = routes.into_iter().map(|(t, q)| (t, Value::String(q))).collect();

    json!({
        "broker_url": config.broker.redacted_url(),
        "default_queue": config.default_queue,
        "eager": config.eager,
        "create_missing_queues": config.create_missing_queues,
        "routes": routes,
        "accept_content": config.accept_content.iter().map(|ct| ct.mime()).collect::<Vec<_>>(),
        "task_serializer": config.serializer.mime(),
        "failure_policy": format!("{:?}", config.failure_policy),
        "publish_timeout_ms": config.publish.timeout.as_millis() as u64,
        "publish_max_attempts": config.publish.max_attempts,
        "log_level": config.log.level,
        "json_logs": config.log.json,
        "tasks": [Compute::NAME, GenerateRandomString::NAME],
    })
}
