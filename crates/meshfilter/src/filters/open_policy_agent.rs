use std::sync::{Arc, Weak};

use anyhow::Context;
use authz_core::{
	CheckPayload, CheckStatus, HttpPolicyClient, PolicyCheck, PolicyConfig, PolicyDecision,
	PolicyMetrics, Resume,
};
use tracing::debug;

use crate::filter::{Action, HttpContext, LocalReply, RequestHeaders, RootContext};
use crate::stream::StreamHandle;

pub struct PolicyRoot {
	check: PolicyCheck,
}

impl PolicyRoot {
	pub fn configure(
		config: &str,
		http: reqwest::Client,
		metrics: Arc<dyn PolicyMetrics>,
	) -> anyhow::Result<Self> {
		let config = PolicyConfig::from_json(config).context("open policy agent configuration")?;
		let client = HttpPolicyClient::new(http, &config);
		let check = PolicyCheck::with_metrics(config, Arc::new(client), metrics);
		Ok(PolicyRoot { check })
	}

	pub fn check(&self) -> &PolicyCheck {
		&self.check
	}
}

impl RootContext for PolicyRoot {
	fn name(&self) -> &'static str {
		"open_policy_agent"
	}

	fn new_http_context(self: Arc<Self>, _context_id: u32) -> Box<dyn HttpContext> {
		Box::new(PolicyFilter { root: self })
	}
}

struct PolicyFilter {
	root: Arc<PolicyRoot>,
}

impl HttpContext for PolicyFilter {
	fn on_request_headers(&mut self, request: &mut RequestHeaders, stream: &Arc<StreamHandle>) -> Action {
		let info = stream.info();
		let payload = CheckPayload {
			source_principal: info.connection.source_principal.clone().unwrap_or_default(),
			destination_workload: info.node.workload_name.clone(),
			request_method: request.method.to_string(),
			request_url_path: request.url_path().to_string(),
		};
		let requester: Weak<dyn Resume> = Arc::downgrade(stream) as Weak<StreamHandle>;

		match self.root.check.check(&payload, requester) {
			CheckStatus::Decided(PolicyDecision::Allow { .. }) => Action::Continue,
			CheckStatus::Decided(PolicyDecision::Deny { reason, status, .. }) => {
				stream.send_local_reply(LocalReply::new(status, reason));
				Action::StopIteration
			},
			CheckStatus::Suspended => {
				debug!(stream = stream.id(), "waiting for policy server");
				Action::Pause
			},
		}
	}
}
