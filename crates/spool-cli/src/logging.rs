use anyhow::Context;
use spool_core::app::LogConfig;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber: `level` is an `EnvFilter` directive,
/// `json` switches to one JSON object per line.
pub fn init(config: &LogConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&config.level)
        .with_context(|| format!("invalid LOG_LEVEL '{}'", config.level))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if config.json {
        builder.json().with_current_span(true).try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))
}
