use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Entries per export call
pub const MAX_BATCH: usize = 500;
pub const EXPORT_TIMEOUT: Duration = Duration::from_millis(5000);
/// Queued batches kept while the sink refuses calls; the oldest is dropped beyond this.
pub const MAX_PENDING_BATCHES: usize = 64;

/// One access log record, written from the server side of a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LogEntry {
	pub source_address: String,
	pub destination_address: String,
	pub destination_workload: String,
	pub destination_namespace: String,
	pub request_id: String,
	pub host: String,
	pub path: String,
	pub referer: String,
	pub user_agent: String,
	pub response_code: u16,
	pub timestamp: DateTime<Utc>,
	pub latency_ms: f64,
}

/// Destination of exported batches.
///
/// The outer result reports whether the call could be started; a batch whose
/// call could not be started stays queued.
pub trait LogSink: Send + Sync {
	fn write_log(&self, batch: &[LogEntry]) -> anyhow::Result<BoxFuture<'static, anyhow::Result<()>>>;
}

#[derive(Serialize)]
struct WriteLogRequest<'a> {
	log_entries: &'a [LogEntry],
}

/// Posts batches as JSON to `{logging_service}/WriteLog`.
///
/// This is a plain HTTP endpoint taking `{"log_entries": [...]}`, not the
/// gRPC `WriteLog` service method.
pub struct HttpLogSink {
	client: reqwest::Client,
	url: String,
}

impl HttpLogSink {
	pub fn new(client: reqwest::Client, logging_service: &str) -> Self {
		HttpLogSink {
			client,
			url: format!("{}/WriteLog", logging_service.trim_end_matches('/')),
		}
	}
}

impl LogSink for HttpLogSink {
	fn write_log(&self, batch: &[LogEntry]) -> anyhow::Result<BoxFuture<'static, anyhow::Result<()>>> {
		let request = self
			.client
			.post(&self.url)
			.json(&WriteLogRequest { log_entries: batch })
			.build()
			.with_context(|| format!("failed to build log export request to {}", self.url))?;
		let call = self.client.execute(request);
		Ok(Box::pin(async move {
			call.await?.error_for_status()?;
			Ok(())
		}))
	}
}

#[derive(Default)]
struct Batches {
	current: Vec<LogEntry>,
	ready: VecDeque<Vec<LogEntry>>,
}

#[derive(Default)]
struct InFlight {
	count: AtomicUsize,
	drained: Notify,
}

impl InFlight {
	fn finish(&self) {
		if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
			self.drained.notify_waiters();
		}
	}
}

/// Buffers log entries and exports them in batches.
pub struct LogExporter {
	sink: Arc<dyn LogSink>,
	batches: Mutex<Batches>,
	in_flight: Arc<InFlight>,
	timeout: Duration,
}

impl LogExporter {
	pub fn new(sink: Arc<dyn LogSink>) -> Self {
		LogExporter {
			sink,
			batches: Mutex::new(Batches::default()),
			in_flight: Arc::new(InFlight::default()),
			timeout: EXPORT_TIMEOUT,
		}
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	pub fn add_entry(&self, entry: LogEntry) {
		let mut batches = self.batches.lock();
		batches.current.push(entry);
		if batches.current.len() >= MAX_BATCH {
			Self::flush_locked(&mut batches);
		}
	}

	/// Move buffered entries into the send queue.
	pub fn flush(&self) {
		Self::flush_locked(&mut self.batches.lock());
	}

	fn flush_locked(batches: &mut Batches) {
		if batches.current.is_empty() {
			return;
		}
		let batch = std::mem::take(&mut batches.current);
		if batches.ready.len() >= MAX_PENDING_BATCHES {
			if let Some(dropped) = batches.ready.pop_front() {
				warn!(entries = dropped.len(), "access log queue full, dropping oldest batch");
			}
		}
		batches.ready.push_back(batch);
	}

	/// Batches waiting to be sent
	pub fn pending(&self) -> usize {
		self.batches.lock().ready.len()
	}

	pub fn in_flight(&self) -> usize {
		self.in_flight.count.load(Ordering::SeqCst)
	}

	pub fn on_tick(&self) {
		self.flush();
		self.send_pending();
	}

	/// Start an export call for every queued batch. Stops at the first
	/// batch whose call cannot be started.
	pub fn send_pending(&self) {
		let Ok(runtime) = tokio::runtime::Handle::try_current() else {
			warn!("no runtime to export access logs on");
			return;
		};
		let mut batches = self.batches.lock();
		while let Some(batch) = batches.ready.front() {
			let call = match self.sink.write_log(batch) {
				Ok(call) => call,
				Err(e) => {
					warn!(error = %e, "failed to start access log export");
					break;
				},
			};
			let entries = batch.len();
			batches.ready.pop_front();

			self.in_flight.count.fetch_add(1, Ordering::SeqCst);
			let in_flight = self.in_flight.clone();
			let timeout = self.timeout;
			runtime.spawn(async move {
				match tokio::time::timeout(timeout, call).await {
					Ok(Ok(())) => debug!(entries, "exported access log batch"),
					Ok(Err(e)) => warn!(entries, error = %e, "access log export failed"),
					Err(_) => warn!(entries, ?timeout, "access log export timed out"),
				}
				in_flight.finish();
			});
		}
	}

	/// Flush everything and wait for all export calls to settle.
	pub async fn shutdown(&self) {
		self.on_tick();
		loop {
			let drained = self.in_flight.drained.notified();
			if self.in_flight() == 0 {
				return;
			}
			drained.await;
		}
	}
}

#[cfg(test)]
mod tests {
	use wiremock::matchers::{method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	use super::*;

	#[derive(Default)]
	struct RecordingSink {
		batches: Mutex<Vec<usize>>,
		refuse: bool,
		fail: bool,
		delay: Option<Duration>,
	}

	impl LogSink for RecordingSink {
		fn write_log(&self, batch: &[LogEntry]) -> anyhow::Result<BoxFuture<'static, anyhow::Result<()>>> {
			if self.refuse {
				anyhow::bail!("sink unavailable");
			}
			self.batches.lock().push(batch.len());
			let fail = self.fail;
			let delay = self.delay;
			Ok(Box::pin(async move {
				if let Some(delay) = delay {
					tokio::time::sleep(delay).await;
				}
				if fail {
					anyhow::bail!("export rejected");
				}
				Ok(())
			}))
		}
	}

	fn entry(code: u16) -> LogEntry {
		LogEntry {
			host: "example.com".to_string(),
			path: "/".to_string(),
			response_code: code,
			..Default::default()
		}
	}

	#[test]
	fn test_full_batch_is_queued() {
		let exporter = LogExporter::new(Arc::new(RecordingSink::default()));
		for _ in 0..MAX_BATCH + 1 {
			exporter.add_entry(entry(200));
		}
		assert_eq!(exporter.pending(), 1);
		exporter.flush();
		assert_eq!(exporter.pending(), 2);
		exporter.flush();
		assert_eq!(exporter.pending(), 2);
	}

	#[test]
	fn test_queue_drops_oldest_batch_when_full() {
		let exporter = LogExporter::new(Arc::new(RecordingSink::default()));
		for code in 0..MAX_PENDING_BATCHES as u16 + 2 {
			exporter.add_entry(entry(code));
			exporter.flush();
		}
		assert_eq!(exporter.pending(), MAX_PENDING_BATCHES);
		let batches = exporter.batches.lock();
		assert_eq!(batches.ready.front().unwrap()[0].response_code, 2);
		assert_eq!(
			batches.ready.back().unwrap()[0].response_code,
			MAX_PENDING_BATCHES as u16 + 1
		);
	}

	#[tokio::test]
	async fn test_shutdown_waits_for_exports() {
		let sink = Arc::new(RecordingSink {
			delay: Some(Duration::from_millis(50)),
			..Default::default()
		});
		let exporter = LogExporter::new(sink.clone());
		for _ in 0..MAX_BATCH + 3 {
			exporter.add_entry(entry(200));
		}
		exporter.shutdown().await;
		assert_eq!(exporter.in_flight(), 0);
		assert_eq!(exporter.pending(), 0);
		assert_eq!(*sink.batches.lock(), vec![MAX_BATCH, 3]);
	}

	#[tokio::test]
	async fn test_failures_settle_like_success() {
		let sink = Arc::new(RecordingSink {
			fail: true,
			..Default::default()
		});
		let exporter = LogExporter::new(sink);
		exporter.add_entry(entry(500));
		exporter.shutdown().await;
		assert_eq!(exporter.in_flight(), 0);

		let sink = Arc::new(RecordingSink {
			delay: Some(Duration::from_secs(60)),
			..Default::default()
		});
		let exporter = LogExporter::new(sink).with_timeout(Duration::from_millis(20));
		exporter.add_entry(entry(200));
		exporter.shutdown().await;
		assert_eq!(exporter.in_flight(), 0);
	}

	#[tokio::test]
	async fn test_unstarted_batch_stays_queued() {
		let sink = Arc::new(RecordingSink {
			refuse: true,
			..Default::default()
		});
		let exporter = LogExporter::new(sink);
		exporter.add_entry(entry(200));
		exporter.on_tick();
		assert_eq!(exporter.pending(), 1);
		assert_eq!(exporter.in_flight(), 0);
	}

	#[tokio::test]
	async fn test_http_sink_posts_batch() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/WriteLog"))
			.respond_with(ResponseTemplate::new(200))
			.expect(1)
			.mount(&server)
			.await;

		let sink = HttpLogSink::new(reqwest::Client::new(), &format!("{}/", server.uri()));
		let exporter = LogExporter::new(Arc::new(sink));
		exporter.add_entry(entry(404));
		exporter.shutdown().await;

		let requests = server.received_requests().await.unwrap();
		let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
		assert_eq!(body["log_entries"][0]["response_code"], 404);
		assert_eq!(body["log_entries"][0]["host"], "example.com");
	}
}
