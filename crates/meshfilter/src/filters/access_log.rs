use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::future::BoxFuture;
use serde::Deserialize;

use crate::filter::{HttpContext, RequestHeaders, ResponseHeaders, RootContext};
use crate::stream::StreamHandle;
use crate::telemetry::log::{HttpLogSink, LogEntry, LogExporter, LogSink};

const FLUSH_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct RawAccessLogConfig {
	#[serde(default)]
	logging_service: String,
}

/// Exports one log entry per request to a logging service.
pub struct AccessLogRoot {
	exporter: Arc<LogExporter>,
}

impl AccessLogRoot {
	pub fn configure(config: &str, http: reqwest::Client) -> anyhow::Result<Self> {
		let config = if config.trim().is_empty() { "{}" } else { config };
		let raw: RawAccessLogConfig =
			serde_json::from_str(config).context("cannot parse access log configuration")?;
		if raw.logging_service.is_empty() {
			anyhow::bail!("logging_service has to be provided in the access log configuration");
		}
		Ok(Self::with_sink(Arc::new(HttpLogSink::new(http, &raw.logging_service))))
	}

	pub fn with_sink(sink: Arc<dyn LogSink>) -> Self {
		AccessLogRoot {
			exporter: Arc::new(LogExporter::new(sink)),
		}
	}

	pub fn exporter(&self) -> &LogExporter {
		&self.exporter
	}
}

impl RootContext for AccessLogRoot {
	fn name(&self) -> &'static str {
		"access_log"
	}

	fn tick_period(&self) -> Option<Duration> {
		Some(FLUSH_PERIOD)
	}

	fn on_tick(&self) {
		self.exporter.on_tick();
	}

	fn on_done(&self) -> BoxFuture<'static, ()> {
		let exporter = self.exporter.clone();
		Box::pin(async move { exporter.shutdown().await })
	}

	fn new_http_context(self: Arc<Self>, _context_id: u32) -> Box<dyn HttpContext> {
		Box::new(AccessLogFilter { root: self })
	}
}

struct AccessLogFilter {
	root: Arc<AccessLogRoot>,
}

impl HttpContext for AccessLogFilter {
	fn on_log(&mut self, request: &RequestHeaders, response: &ResponseHeaders, stream: &StreamHandle) {
		let info = stream.info();
		let header = |name: &str| request.header(name).unwrap_or_default().to_string();
		self.root.exporter.add_entry(LogEntry {
			source_address: info.connection.source_address.clone().unwrap_or_default(),
			destination_address: info.connection.destination_address.clone().unwrap_or_default(),
			destination_workload: info.node.workload_name.clone(),
			destination_namespace: info.node.namespace.clone(),
			request_id: header("x-request-id"),
			host: request.authority.clone(),
			path: request.url_path().to_string(),
			referer: header("referer"),
			user_agent: header("user-agent"),
			response_code: response.status.as_u16(),
			timestamp: info.start_time,
			latency_ms: info.elapsed().as_secs_f64() * 1000.0,
		});
	}
}

#[cfg(test)]
mod tests {
	use http::header::USER_AGENT;
	use http::{HeaderValue, Method, StatusCode};
	use parking_lot::Mutex;

	use super::*;
	use crate::chain::FilterChain;
	use crate::filter::{ConnectionInfo, NodeInfo};

	#[derive(Default)]
	struct CollectingSink {
		entries: Mutex<Vec<LogEntry>>,
	}

	impl LogSink for CollectingSink {
		fn write_log(&self, batch: &[LogEntry]) -> anyhow::Result<BoxFuture<'static, anyhow::Result<()>>> {
			self.entries.lock().extend_from_slice(batch);
			Ok(Box::pin(async { Ok(()) }))
		}
	}

	#[test]
	fn test_logging_service_required() {
		assert!(AccessLogRoot::configure("", reqwest::Client::new()).is_err());
		assert!(AccessLogRoot::configure("{}", reqwest::Client::new()).is_err());
		assert!(
			AccessLogRoot::configure(
				r#"{"logging_service": "http://logs:8080", "extra": true}"#,
				reqwest::Client::new()
			)
			.is_ok()
		);
	}

	#[tokio::test]
	async fn test_entry_per_request() {
		let sink = Arc::new(CollectingSink::default());
		let root = Arc::new(AccessLogRoot::with_sink(sink.clone()));
		let node = NodeInfo {
			workload_name: "reviews-v1".to_string(),
			namespace: "bookinfo".to_string(),
		};
		let chain = FilterChain::new(vec![root.clone()], node);

		let connection = ConnectionInfo {
			source_address: Some("10.0.0.1:5555".to_string()),
			..Default::default()
		};
		let mut stream = chain.new_stream(connection);
		let request = RequestHeaders::new(Method::GET, "reviews:9080", "/reviews/1?x=1")
			.with_header(http::header::HeaderName::from_static("x-request-id"), HeaderValue::from_static("abc"))
			.with_header(USER_AGENT, HeaderValue::from_static("curl/8.0"));
		let response = ResponseHeaders::new(StatusCode::NOT_FOUND);
		stream.on_log(&request, &response);
		drop(stream);

		root.on_done().await;
		let entries = sink.entries.lock();
		assert_eq!(entries.len(), 1);
		let entry = &entries[0];
		assert_eq!(entry.source_address, "10.0.0.1:5555");
		assert_eq!(entry.destination_workload, "reviews-v1");
		assert_eq!(entry.destination_namespace, "bookinfo");
		assert_eq!(entry.request_id, "abc");
		assert_eq!(entry.host, "reviews:9080");
		assert_eq!(entry.path, "/reviews/1");
		assert_eq!(entry.user_agent, "curl/8.0");
		assert_eq!(entry.referer, "");
		assert_eq!(entry.response_code, 404);
	}
}
