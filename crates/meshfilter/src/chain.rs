use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, warn};

use crate::filter::{
	Action, ConnectionInfo, HttpContext, LocalReply, NodeInfo, RequestHeaders, ResponseHeaders,
	RootContext, StreamInfo,
};
use crate::stream::StreamHandle;
use crate::telemetry::metrics::Metrics;

/// Result of running one request phase through the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
	Continue,
	Reply(LocalReply),
}

/// The ordered filters of one worker.
pub struct FilterChain {
	roots: Vec<Arc<dyn RootContext>>,
	node: Arc<NodeInfo>,
	next_id: AtomicU32,
	metrics: Option<Arc<Metrics>>,
}

impl FilterChain {
	pub fn new(roots: Vec<Arc<dyn RootContext>>, node: NodeInfo) -> Self {
		FilterChain {
			roots,
			node: Arc::new(node),
			next_id: AtomicU32::new(1),
			metrics: None,
		}
	}

	/// Count local replies per filter.
	pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
		self.metrics = Some(metrics);
		self
	}

	pub fn roots(&self) -> &[Arc<dyn RootContext>] {
		&self.roots
	}

	pub fn names(&self) -> Vec<&'static str> {
		self.roots.iter().map(|r| r.name()).collect()
	}

	pub fn new_stream(&self, connection: ConnectionInfo) -> Stream {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let handle = Arc::new(StreamHandle::new(
			id,
			StreamInfo::new(connection, self.node.clone()),
		));
		let contexts = self
			.roots
			.iter()
			.map(|root| root.clone().new_http_context(id))
			.collect();
		Stream {
			handle,
			contexts,
			names: self.names(),
			metrics: self.metrics.clone(),
		}
	}
}

/// One request flowing through the chain. Dropping it tears the request down.
pub struct Stream {
	handle: Arc<StreamHandle>,
	contexts: Vec<Box<dyn HttpContext>>,
	names: Vec<&'static str>,
	metrics: Option<Arc<Metrics>>,
}

impl Stream {
	pub fn id(&self) -> u32 {
		self.handle.id()
	}

	pub fn handle(&self) -> &Arc<StreamHandle> {
		&self.handle
	}

	pub async fn on_request_headers(&mut self, request: &mut RequestHeaders) -> Outcome {
		for (idx, ctx) in self.contexts.iter_mut().enumerate() {
			let action = ctx.on_request_headers(request, &self.handle);
			if let Some(reply) = settle(&self.handle, action).await {
				return replied(self.metrics.as_deref(), self.names[idx], reply);
			}
		}
		Outcome::Continue
	}

	/// Run the complete, buffered request body through the chain.
	pub async fn on_request_body(&mut self, body: &[u8]) -> Outcome {
		for (idx, ctx) in self.contexts.iter_mut().enumerate() {
			let action = ctx.on_request_body(body, &self.handle);
			if let Some(reply) = settle(&self.handle, action).await {
				return replied(self.metrics.as_deref(), self.names[idx], reply);
			}
		}
		Outcome::Continue
	}

	/// Response filters run in reverse order.
	pub fn on_response_headers(&mut self, response: &mut ResponseHeaders) {
		for ctx in self.contexts.iter_mut().rev() {
			if ctx.on_response_headers(response) != Action::Continue {
				break;
			}
		}
	}

	pub fn on_log(&mut self, request: &RequestHeaders, response: &ResponseHeaders) {
		for ctx in self.contexts.iter_mut() {
			ctx.on_log(request, response, &self.handle);
		}
	}
}

impl Drop for Stream {
	fn drop(&mut self) {
		self.handle.tear_down();
		for ctx in self.contexts.iter_mut() {
			ctx.on_done();
		}
	}
}

fn replied(metrics: Option<&Metrics>, filter: &'static str, reply: LocalReply) -> Outcome {
	if let Some(metrics) = metrics {
		metrics.record_local_reply(filter, reply.status.as_u16());
	}
	Outcome::Reply(reply)
}

async fn settle(handle: &StreamHandle, action: Action) -> Option<LocalReply> {
	match action {
		Action::Continue => return handle.local_reply(),
		Action::Pause => {
			debug!(stream = handle.id(), "stream paused");
			handle.wait_resumed().await;
		},
		Action::StopIteration => {},
	}
	match (action, handle.local_reply()) {
		(_, Some(reply)) => Some(reply),
		(Action::StopIteration, None) => {
			warn!(stream = handle.id(), "filter stopped the request without a reply");
			Some(LocalReply::new(500, "filter stopped the request"))
		},
		_ => None,
	}
}
