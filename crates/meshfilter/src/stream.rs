use std::sync::atomic::{AtomicBool, Ordering};

use authz_core::{PolicyDecision, Resume};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::filter::{LocalReply, StreamInfo};

#[derive(Debug, Default)]
struct StreamState {
	local_reply: Option<LocalReply>,
	decision: Option<PolicyDecision>,
	resumed: bool,
}

/// State of one request shared between the chain and asynchronous
/// completions. Completions hold it weakly and check `is_torn_down` first.
#[derive(Debug)]
pub struct StreamHandle {
	id: u32,
	info: StreamInfo,
	state: Mutex<StreamState>,
	torn_down: AtomicBool,
	resumed: Notify,
}

impl StreamHandle {
	pub fn new(id: u32, info: StreamInfo) -> Self {
		StreamHandle {
			id,
			info,
			state: Mutex::new(StreamState::default()),
			torn_down: AtomicBool::new(false),
			resumed: Notify::new(),
		}
	}

	pub fn id(&self) -> u32 {
		self.id
	}

	pub fn info(&self) -> &StreamInfo {
		&self.info
	}

	/// Reply to the downstream directly. The first reply wins.
	pub fn send_local_reply(&self, reply: LocalReply) {
		let mut state = self.state.lock();
		if state.local_reply.is_none() {
			state.local_reply = Some(reply);
		}
	}

	pub fn local_reply(&self) -> Option<LocalReply> {
		self.state.lock().local_reply.clone()
	}

	/// Last decision this stream was resumed with
	pub fn decision(&self) -> Option<PolicyDecision> {
		self.state.lock().decision.clone()
	}

	pub fn tear_down(&self) {
		self.torn_down.store(true, Ordering::SeqCst);
		// wake a paused chain so it can observe the teardown
		self.resumed.notify_waiters();
	}

	/// Let a paused chain go on without a policy decision. A local reply
	/// sent before this call still ends the chain.
	pub fn continue_request(&self) {
		if self.is_torn_down() {
			return;
		}
		self.state.lock().resumed = true;
		self.resumed.notify_waiters();
	}

	/// Wait for the next `resume`. Returns early if the stream is torn down.
	pub async fn wait_resumed(&self) {
		loop {
			let notified = self.resumed.notified();
			let resumed = std::mem::take(&mut self.state.lock().resumed);
			if resumed || self.is_torn_down() {
				return;
			}
			notified.await;
		}
	}
}

impl Resume for StreamHandle {
	fn resume(&self, decision: PolicyDecision) {
		if self.is_torn_down() {
			return;
		}
		{
			let mut state = self.state.lock();
			if let PolicyDecision::Deny { reason, status, .. } = &decision {
				if state.local_reply.is_none() {
					state.local_reply = Some(LocalReply::new(*status, reason.clone()));
				}
			}
			debug!(stream = self.id, allowed = decision.is_allowed(), "stream resumed");
			state.decision = Some(decision);
			state.resumed = true;
		}
		self.resumed.notify_waiters();
	}

	fn is_torn_down(&self) -> bool {
		self.torn_down.load(Ordering::SeqCst)
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use authz_core::DecisionSource;

	use super::*;
	use crate::filter::{ConnectionInfo, NodeInfo};

	fn handle() -> Arc<StreamHandle> {
		Arc::new(StreamHandle::new(
			1,
			StreamInfo::new(ConnectionInfo::default(), Arc::new(NodeInfo::default())),
		))
	}

	#[tokio::test]
	async fn test_resume_wakes_waiter() {
		let h = handle();
		let waiter = {
			let h = h.clone();
			tokio::spawn(async move { h.wait_resumed().await })
		};
		tokio::task::yield_now().await;
		h.resume(PolicyDecision::allow(DecisionSource::Remote));
		waiter.await.unwrap();
		assert!(h.local_reply().is_none());
		assert_eq!(h.decision(), Some(PolicyDecision::allow(DecisionSource::Remote)));
	}

	#[tokio::test]
	async fn test_resume_before_wait_is_not_lost() {
		let h = handle();
		h.resume(PolicyDecision::failed("OPA policy check failed"));
		h.wait_resumed().await;
		let reply = h.local_reply().unwrap();
		assert_eq!(reply.status.as_u16(), 500);
		assert_eq!(reply.body, "OPA policy check failed");
	}

	#[tokio::test]
	async fn test_torn_down_stream_ignores_resume() {
		let h = handle();
		h.tear_down();
		h.resume(PolicyDecision::denied(DecisionSource::Remote));
		assert!(h.local_reply().is_none());
		assert!(h.decision().is_none());
		// does not hang
		h.wait_resumed().await;
	}

	#[tokio::test]
	async fn test_continue_request_wakes_without_decision() {
		let h = handle();
		let waiter = {
			let h = h.clone();
			tokio::spawn(async move { h.wait_resumed().await })
		};
		tokio::task::yield_now().await;
		h.send_local_reply(LocalReply::new(307, "Redirecting..."));
		h.continue_request();
		waiter.await.unwrap();
		assert!(h.decision().is_none());
		assert_eq!(h.local_reply().unwrap().status.as_u16(), 307);
	}

	#[test]
	fn test_first_local_reply_wins() {
		let h = handle();
		h.send_local_reply(LocalReply::new(401, "first"));
		h.send_local_reply(LocalReply::new(403, "second"));
		assert_eq!(h.local_reply().unwrap().body, "first");
	}
}
