use std::sync::Arc;

use anyhow::Context;
use http::header::{CONTENT_TYPE, COOKIE};
use itertools::Itertools;
use tracing::{debug, warn};
use waf_core::{Finding, WafConfig, WafInspector};

use crate::filter::{Action, HttpContext, LocalReply, RequestHeaders, RootContext};
use crate::stream::StreamHandle;

pub const SQLI_BODY: &str = "SQL injection detected";

pub struct WafRoot {
	inspector: WafInspector,
}

impl WafRoot {
	pub fn configure(config: &str) -> anyhow::Result<Self> {
		let config = WafConfig::parse(config).context("waf configuration")?;
		debug!(%config, "waf configured");
		Ok(WafRoot {
			inspector: WafInspector::new(config),
		})
	}
}

impl RootContext for WafRoot {
	fn name(&self) -> &'static str {
		"waf_sqli"
	}

	fn new_http_context(self: Arc<Self>, _context_id: u32) -> Box<dyn HttpContext> {
		Box::new(WafFilter {
			root: self,
			content_type: None,
		})
	}
}

struct WafFilter {
	root: Arc<WafRoot>,
	/// Recorded from the request headers for the body phase
	content_type: Option<String>,
}

impl WafFilter {
	fn inspect_headers(&self, request: &RequestHeaders) -> Option<Finding> {
		let inspector = &self.root.inspector;
		let pseudo = [
			(":method", request.method.as_str()),
			(":authority", request.authority.as_str()),
			(":path", request.path.as_str()),
		];
		let headers = request
			.headers
			.iter()
			.filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?)));
		if let Some(finding) = inspector.inspect_headers(pseudo.into_iter().chain(headers)) {
			return Some(finding);
		}

		let cookie = request
			.headers
			.get_all(COOKIE)
			.iter()
			.filter_map(|v| v.to_str().ok())
			.join("; ");
		if let Some(finding) = inspector.inspect_cookie(&cookie) {
			return Some(finding);
		}

		inspector.inspect_path(&request.path)
	}
}

fn reject(stream: &StreamHandle, finding: Finding) -> Action {
	warn!(part = %finding.part, key = ?finding.key, "SQL injection detected");
	stream.send_local_reply(
		LocalReply::new(403, SQLI_BODY).with_details(format!("SQLi at {}", finding.part)),
	);
	Action::StopIteration
}

impl HttpContext for WafFilter {
	fn on_request_headers(&mut self, request: &mut RequestHeaders, stream: &Arc<StreamHandle>) -> Action {
		if let Some(finding) = self.inspect_headers(request) {
			return reject(stream, finding);
		}
		self.content_type = request.header(CONTENT_TYPE).map(str::to_string);
		Action::Continue
	}

	fn on_request_body(&mut self, body: &[u8], stream: &Arc<StreamHandle>) -> Action {
		match self
			.root
			.inspector
			.inspect_body(self.content_type.as_deref(), body)
		{
			Some(finding) => reject(stream, finding),
			None => Action::Continue,
		}
	}
}
