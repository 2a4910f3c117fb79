//! Process configuration, read once from the environment at startup.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::codec::{Codec, ContentType};
use crate::domain::{Disposition, FailurePolicy, QueueName, TaskName};

use super::retry::RetryPolicy;
use super::routing::Router;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl fmt::Display) -> Self {
        ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Broker connection parameters.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl BrokerConfig {
    pub const DEFAULT_PORT: u16 = 5672;

    pub fn url(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}//",
            self.user, self.password, self.host, self.port
        )
    }

    /// Same as [`url`](Self::url) with the password masked, for logs.
    pub fn redacted_url(&self) -> String {
        format!("amqp://{}:***@{}:{}//", self.user, self.host, self.port)
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishConfig {
    /// Bound on a single publish attempt.
    pub timeout: Duration,
    pub max_attempts: u32,
    pub retry: RetryPolicy,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            max_attempts: 3,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `spool_core=debug,info`.
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpoolConfig {
    pub broker: BrokerConfig,
    pub default_queue: QueueName,
    /// Run tasks in the caller instead of publishing them.
    pub eager: bool,
    pub create_missing_queues: bool,
    pub routes: HashMap<TaskName, QueueName>,
    pub accept_content: Vec<ContentType>,
    pub serializer: ContentType,
    pub failure_policy: FailurePolicy,
    pub unknown_task_policy: Disposition,
    /// Refuse to enqueue names that are not registered locally.
    pub validate_tasks: bool,
    pub publish: PublishConfig,
    pub log: LogConfig,
}

impl SpoolConfig {
    /// Defaults suitable for an in-process broker: local credentials, lazy
    /// queue creation, both content types accepted.
    pub fn local(default_queue: impl Into<QueueName>) -> Self {
        Self {
            broker: BrokerConfig {
                host: "localhost".to_string(),
                port: BrokerConfig::DEFAULT_PORT,
                user: "guest".to_string(),
                password: "guest".to_string(),
            },
            default_queue: default_queue.into(),
            eager: false,
            create_missing_queues: true,
            routes: HashMap::new(),
            accept_content: vec![ContentType::Json, ContentType::MessagePack],
            serializer: ContentType::Json,
            failure_policy: FailurePolicy::default(),
            unknown_task_policy: Disposition::DeadLetter,
            validate_tasks: true,
            publish: PublishConfig::default(),
            log: LogConfig::default(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let require = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let broker = BrokerConfig {
            host: require("BROKER_HOST")?,
            port: match get("BROKER_PORT") {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|e| ConfigError::invalid("BROKER_PORT", &raw, e))?,
                None => BrokerConfig::DEFAULT_PORT,
            },
            user: require("BROKER_USER")?,
            password: require("BROKER_PASSWORD")?,
        };
        let default_queue = QueueName::new(require("DEFAULT_QUEUE")?.trim());

        let eager = match get("EAGER") {
            Some(raw) => parse_bool("EAGER", &raw)?,
            None => match get("IS_DEV_APP") {
                Some(raw) => parse_bool("IS_DEV_APP", &raw)?,
                None => false,
            },
        };
        let create_missing_queues = get("CREATE_MISSING_QUEUES")
            .map(|raw| parse_bool("CREATE_MISSING_QUEUES", &raw))
            .transpose()?
            .unwrap_or(true);

        let routes = get("TASK_ROUTES")
            .map(|raw| parse_routes(&raw))
            .transpose()?
            .unwrap_or_default();

        let accept_content = match get("ACCEPT_CONTENT") {
            Some(raw) => parse_accept(&raw)?,
            None => vec![ContentType::Json, ContentType::MessagePack],
        };
        let serializer = match get("TASK_SERIALIZER") {
            Some(raw) => raw
                .parse::<ContentType>()
                .map_err(|e| ConfigError::invalid("TASK_SERIALIZER", &raw, e))?,
            None => ContentType::Json,
        };
        if !accept_content.contains(&serializer) {
            return Err(ConfigError::invalid(
                "TASK_SERIALIZER",
                serializer.mime(),
                "serializer must be listed in ACCEPT_CONTENT",
            ));
        }

        let failure_policy = match get("FAILURE_POLICY") {
            Some(raw) => raw
                .parse::<FailurePolicy>()
                .map_err(|e| ConfigError::invalid("FAILURE_POLICY", &raw, e))?,
            None => FailurePolicy::default(),
        };

        let mut publish = PublishConfig::default();
        if let Some(raw) = get("PUBLISH_TIMEOUT_MS") {
            let ms: u64 = raw
                .trim()
                .parse()
                .map_err(|e| ConfigError::invalid("PUBLISH_TIMEOUT_MS", &raw, e))?;
            publish.timeout = Duration::from_millis(ms);
        }
        if let Some(raw) = get("PUBLISH_MAX_ATTEMPTS") {
            publish.max_attempts = raw
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    ConfigError::invalid("PUBLISH_MAX_ATTEMPTS", &raw, "expected a positive integer")
                })?;
        }

        let log = LogConfig {
            level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            json: get("JSON_LOGS")
                .map(|raw| parse_bool("JSON_LOGS", &raw))
                .transpose()?
                .unwrap_or(false),
        };

        Ok(Self {
            broker,
            default_queue,
            eager,
            create_missing_queues,
            routes,
            accept_content,
            serializer,
            failure_policy,
            unknown_task_policy: Disposition::DeadLetter,
            validate_tasks: true,
            publish,
            log,
        })
    }

    pub fn broker_url(&self) -> String {
        self.broker.url()
    }

    /// Add a route unless one is already configured for `task`.
    pub fn route_default(&mut self, task: impl Into<TaskName>, queue: impl Into<QueueName>) {
        self.routes.entry(task.into()).or_insert_with(|| queue.into());
    }

    pub fn codec(&self) -> Codec {
        Codec::new(self.serializer, self.accept_content.clone())
    }

    pub fn router(&self) -> Router {
        Router::new(self.routes.clone(), self.default_queue.clone())
    }
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, raw, "expected true or false")),
    }
}

/// `name=queue,name=queue`
fn parse_routes(raw: &str) -> Result<HashMap<TaskName, QueueName>, ConfigError> {
    let mut routes = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (task, queue) = entry
            .split_once('=')
            .map(|(t, q)| (t.trim(), q.trim()))
            .filter(|(t, q)| !t.is_empty() && !q.is_empty())
            .ok_or_else(|| ConfigError::invalid("TASK_ROUTES", entry, "expected name=queue"))?;
        routes.insert(TaskName::new(task), QueueName::new(queue));
    }
    Ok(routes)
}

fn parse_accept(raw: &str) -> Result<Vec<ContentType>, ConfigError> {
    let mut accept = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let ct = name
            .parse::<ContentType>()
            .map_err(|e| ConfigError::invalid("ACCEPT_CONTENT", name, e))?;
        if !accept.contains(&ct) {
            accept.push(ct);
        }
    }
    if accept.is_empty() {
        return Err(ConfigError::invalid("ACCEPT_CONTENT", raw, "no content types listed"));
    }
    Ok(accept)
}
