use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;

use crate::filter::NodeInfo;
use crate::filters::FilterKind;

#[derive(Deserialize, Default, Clone, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
// RawConfig is the host file as written. Config is the resolved form.
struct RawConfig {
	logging: Option<RawLogging>,
	workers: Option<usize>,
	metrics_addr: Option<SocketAddr>,
	#[serde(default)]
	node: NodeInfo,
	#[serde(default)]
	filters: Vec<RawFilter>,
}

#[derive(Deserialize, Default, Clone, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawLogging {
	level: Option<String>,
	format: Option<LoggingFormat>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
struct RawFilter {
	name: FilterKind,
	/// Handed to the filter as JSON. A string is passed through unchanged.
	#[serde(default)]
	config: Value,
}

#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum LoggingFormat {
	#[default]
	Text,
	Json,
}

impl FromStr for LoggingFormat {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"text" => Ok(LoggingFormat::Text),
			"json" => Ok(LoggingFormat::Json),
			other => anyhow::bail!("unknown log format {other:?}"),
		}
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoggingConfig {
	/// `EnvFilter` directives
	pub level: String,
	pub format: LoggingFormat,
}

impl Default for LoggingConfig {
	fn default() -> Self {
		LoggingConfig {
			level: "info".to_string(),
			format: LoggingFormat::Text,
		}
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterConfig {
	pub kind: FilterKind,
	/// Configuration string handed to the filter
	pub config: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
	pub logging: LoggingConfig,
	/// Number of independent filter chains
	pub workers: usize,
	/// Address of the `/metrics` listener. Metrics are still recorded when unset.
	pub metrics_addr: Option<SocketAddr>,
	pub node: NodeInfo,
	pub filters: Vec<FilterConfig>,
}

pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
	let raw: RawConfig = if contents.trim().is_empty() {
		RawConfig::default()
	} else {
		serde_yaml::from_str(contents).context("invalid config file")?
	};
	let raw_logging = raw.logging.unwrap_or_default();

	let logging = LoggingConfig {
		level: parse::<String>("LOG_LEVEL")?
			.or(raw_logging.level)
			.unwrap_or_else(|| LoggingConfig::default().level),
		format: parse::<LoggingFormat>("LOG_FORMAT")?
			.or(raw_logging.format)
			.unwrap_or_default(),
	};

	let workers = parse::<usize>("WORKERS")?.or(raw.workers).unwrap_or(1);
	if workers == 0 {
		anyhow::bail!("workers must be at least 1");
	}

	let metrics_addr = parse::<SocketAddr>("METRICS_ADDR")?.or(raw.metrics_addr);

	let filters = raw
		.filters
		.into_iter()
		.map(|f| -> anyhow::Result<FilterConfig> {
			let config = match f.config {
				Value::Null => String::new(),
				Value::String(s) => s,
				other => serde_json::to_string(&other)
					.with_context(|| format!("cannot encode configuration of filter {}", f.name))?,
			};
			Ok(FilterConfig {
				kind: f.name,
				config,
			})
		})
		.collect::<anyhow::Result<_>>()?;

	Ok(Config {
		logging,
		workers,
		metrics_addr,
		node: raw.node,
		filters,
	})
}

pub async fn load(path: &Path) -> anyhow::Result<Config> {
	let contents = tokio::fs::read_to_string(path)
		.await
		.with_context(|| format!("failed to read config file {}", path.display()))?;
	parse_config(&contents).with_context(|| format!("failed to load {}", path.display()))
}

fn parse<T: FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: ToString,
{
	match env::var(env) {
		Ok(val) => val
			.parse()
			.map(Some)
			.map_err(|e: <T as FromStr>::Err| {
				anyhow::anyhow!("invalid env var {}={} ({})", env, val, e.to_string())
			}),
		Err(_) => Ok(None),
	}
}
