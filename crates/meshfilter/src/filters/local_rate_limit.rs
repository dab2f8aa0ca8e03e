use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use http::HeaderValue;
use http::header::RETRY_AFTER;
use ratelimit_core::{
	Config, RATE_LIMITED_BODY, RATE_LIMITED_DETAILS, RateLimitDecision, RateLimiter, RequestInfo, SharedData,
};

use crate::filter::{Action, HttpContext, LocalReply, RequestHeaders, RootContext};
use crate::stream::StreamHandle;

pub struct RateLimitRoot {
	limiter: RateLimiter,
}

impl RateLimitRoot {
	pub fn configure(config: &str, shared_data: Arc<dyn SharedData>) -> anyhow::Result<Self> {
		let config = Config::from_json(config)?;
		let limiter = RateLimiter::new(config, shared_data);
		limiter
			.initialize()
			.context("failed to initialize the shared token bucket")?;
		Ok(RateLimitRoot { limiter })
	}

	pub fn limiter(&self) -> &RateLimiter {
		&self.limiter
	}
}

impl RootContext for RateLimitRoot {
	fn name(&self) -> &'static str {
		"local_rate_limit"
	}

	fn tick_period(&self) -> Option<Duration> {
		Some(self.limiter.config().refill_interval())
	}

	fn on_tick(&self) {
		self.limiter.on_tick();
	}

	fn new_http_context(self: Arc<Self>, _context_id: u32) -> Box<dyn HttpContext> {
		Box::new(RateLimitFilter { root: self })
	}
}

struct RateLimitFilter {
	root: Arc<RateLimitRoot>,
}

impl HttpContext for RateLimitFilter {
	fn on_request_headers(&mut self, request: &mut RequestHeaders, stream: &Arc<StreamHandle>) -> Action {
		let info = RequestInfo {
			method: request.method.as_str(),
			host: &request.authority,
			path: &request.path,
		};
		match self.root.limiter.check(&info) {
			RateLimitDecision::Allow => Action::Continue,
			decision @ RateLimitDecision::LimitExceeded { retry_after } => {
				let status = decision.status().unwrap_or(429);
				stream.send_local_reply(
					LocalReply::new(status, RATE_LIMITED_BODY)
						.with_details(RATE_LIMITED_DETAILS)
						.with_header(RETRY_AFTER, HeaderValue::from(retry_after.as_secs())),
				);
				Action::StopIteration
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use http::Method;
	use ratelimit_core::InMemorySharedData;

	use super::*;
	use crate::chain::{FilterChain, Outcome};
	use crate::filter::{ConnectionInfo, NodeInfo};

	const CONFIG: &str = r#"{"max_tokens": 2, "tokens_per_refill": 2, "refill_interval_sec": 1}"#;

	#[tokio::test]
	async fn test_workers_share_bucket() {
		let store: Arc<dyn SharedData> = Arc::new(InMemorySharedData::new());
		let chains: Vec<FilterChain> = (0..2)
			.map(|_| {
				let root = RateLimitRoot::configure(CONFIG, store.clone()).unwrap();
				FilterChain::new(vec![Arc::new(root)], NodeInfo::default())
			})
			.collect();
		let mut request = RequestHeaders::new(Method::GET, "example.com", "/");

		let mut outcomes = Vec::new();
		for chain in chains.iter().cycle().take(3) {
			let mut stream = chain.new_stream(ConnectionInfo::default());
			outcomes.push(stream.on_request_headers(&mut request).await);
		}
		assert_eq!(outcomes[0], Outcome::Continue);
		assert_eq!(outcomes[1], Outcome::Continue);
		let Outcome::Reply(reply) = &outcomes[2] else {
			panic!("third request should be limited");
		};
		assert_eq!(reply.status.as_u16(), 429);
		assert_eq!(reply.body, "Too many requests");
		assert_eq!(reply.details, "rate_limited");
		assert_eq!(reply.headers.get(RETRY_AFTER).unwrap(), "1");
	}

	#[test]
	fn test_tick_period_is_refill_interval() {
		let root = RateLimitRoot::configure(CONFIG, Arc::new(InMemorySharedData::new())).unwrap();
		assert_eq!(root.tick_period(), Some(Duration::from_secs(1)));
		assert!(RateLimitRoot::configure("{}", Arc::new(InMemorySharedData::new())).is_err());
	}
}
