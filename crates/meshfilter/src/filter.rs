use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};

use crate::stream::StreamHandle;

/// What the chain does after a filter callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
	Continue,
	/// Wait until the stream is resumed, then continue unless a local reply was sent
	Pause,
	/// Stop the chain; the filter has sent a local reply
	StopIteration,
}

/// A response generated by a filter instead of forwarding the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalReply {
	pub status: StatusCode,
	pub body: String,
	/// Short reason recorded in the access log
	pub details: String,
	pub headers: HeaderMap,
}

impl LocalReply {
	pub fn new(status: u16, body: impl Into<String>) -> Self {
		LocalReply {
			status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
			body: body.into(),
			details: String::new(),
			headers: HeaderMap::new(),
		}
	}

	pub fn with_details(mut self, details: impl Into<String>) -> Self {
		self.details = details.into();
		self
	}

	pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
		self.headers.insert(name, value);
		self
	}

	/// Add a value without replacing earlier ones, as for `Set-Cookie`.
	pub fn append_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
		self.headers.append(name, value);
		self
	}
}

#[derive(Debug, Clone)]
pub struct RequestHeaders {
	pub method: Method,
	/// `:authority`, possibly with a port
	pub authority: String,
	/// `:path`, including the query string
	pub path: String,
	pub headers: HeaderMap,
}

impl RequestHeaders {
	pub fn new(method: Method, authority: impl Into<String>, path: impl Into<String>) -> Self {
		RequestHeaders {
			method,
			authority: authority.into(),
			path: path.into(),
			headers: HeaderMap::new(),
		}
	}

	pub fn from_parts(parts: &http::request::Parts) -> Self {
		let authority = parts
			.uri
			.authority()
			.map(|a| a.as_str())
			.or_else(|| parts.headers.get(http::header::HOST).and_then(|h| h.to_str().ok()))
			.unwrap_or_default();
		let path = parts
			.uri
			.path_and_query()
			.map(|p| p.as_str())
			.unwrap_or("/");
		RequestHeaders {
			method: parts.method.clone(),
			authority: authority.to_string(),
			path: path.to_string(),
			headers: parts.headers.clone(),
		}
	}

	pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
		self.headers.append(name, value);
		self
	}

	/// First value of a header, if it is visible ASCII.
	pub fn header(&self, name: impl http::header::AsHeaderName) -> Option<&str> {
		self.headers.get(name).and_then(|v| v.to_str().ok())
	}

	/// Path without the query string.
	pub fn url_path(&self) -> &str {
		self
			.path
			.split_once('?')
			.map(|(path, _)| path)
			.unwrap_or(&self.path)
	}
}

#[derive(Debug, Clone)]
pub struct ResponseHeaders {
	pub status: StatusCode,
	pub headers: HeaderMap,
}

impl ResponseHeaders {
	pub fn new(status: StatusCode) -> Self {
		ResponseHeaders {
			status,
			headers: HeaderMap::new(),
		}
	}
}

impl From<&LocalReply> for ResponseHeaders {
	fn from(reply: &LocalReply) -> Self {
		ResponseHeaders {
			status: reply.status,
			headers: reply.headers.clone(),
		}
	}
}

/// Peer identity of the downstream connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
	pub source_address: Option<String>,
	pub destination_address: Option<String>,
	/// URI SAN of the peer certificate
	pub source_principal: Option<String>,
}

/// Metadata of the workload the filters run in front of.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeInfo {
	pub workload_name: String,
	pub namespace: String,
}

#[derive(Debug, Clone)]
pub struct StreamInfo {
	pub connection: ConnectionInfo,
	pub node: Arc<NodeInfo>,
	pub start_time: DateTime<Utc>,
	started: Instant,
}

impl StreamInfo {
	pub fn new(connection: ConnectionInfo, node: Arc<NodeInfo>) -> Self {
		StreamInfo {
			connection,
			node,
			start_time: Utc::now(),
			started: Instant::now(),
		}
	}

	pub fn elapsed(&self) -> Duration {
		self.started.elapsed()
	}
}

/// Per-worker, per-filter state. Lives as long as the filter chain and
/// creates one [`HttpContext`] per request.
pub trait RootContext: Send + Sync + 'static {
	fn name(&self) -> &'static str;

	/// Period of the `on_tick` timer; `None` disables it.
	fn tick_period(&self) -> Option<Duration> {
		None
	}

	fn on_tick(&self) {}

	/// Completes once any pending work has settled.
	fn on_done(&self) -> BoxFuture<'static, ()> {
		Box::pin(async {})
	}

	fn new_http_context(self: Arc<Self>, context_id: u32) -> Box<dyn HttpContext>;
}

/// Per-request filter state.
pub trait HttpContext: Send {
	fn on_request_headers(&mut self, _request: &mut RequestHeaders, _stream: &Arc<StreamHandle>) -> Action {
		Action::Continue
	}

	/// Called once with the complete request body.
	fn on_request_body(&mut self, _body: &[u8], _stream: &Arc<StreamHandle>) -> Action {
		Action::Continue
	}

	fn on_response_headers(&mut self, _response: &mut ResponseHeaders) -> Action {
		Action::Continue
	}

	fn on_log(&mut self, _request: &RequestHeaders, _response: &ResponseHeaders, _stream: &StreamHandle) {}

	fn on_done(&mut self) {}
}
