use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{LoggingConfig, LoggingFormat};

pub mod log;
pub mod metrics;

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
	let filter = EnvFilter::try_from_default_env()
		.or_else(|_| EnvFilter::try_new(&config.level))
		.map_err(|e| anyhow::anyhow!("invalid log level {:?}: {e}", config.level))?;
	let registry = tracing_subscriber::registry().with(filter);
	let result = match config.format {
		LoggingFormat::Json => registry.with(fmt::layer().json()).try_init(),
		LoggingFormat::Text => registry.with(fmt::layer().with_target(true)).try_init(),
	};
	result.map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))
}
