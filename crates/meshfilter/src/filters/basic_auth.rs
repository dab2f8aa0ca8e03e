use std::sync::Arc;

use anyhow::Context;
use basicauth_core::{AuthDecision, BasicAuth, BasicAuthConfig};
use http::HeaderValue;
use http::header::{AUTHORIZATION, WWW_AUTHENTICATE};

use crate::filter::{Action, HttpContext, LocalReply, RequestHeaders, RootContext};
use crate::stream::StreamHandle;

pub struct BasicAuthRoot {
	auth: BasicAuth,
	challenge: HeaderValue,
}

impl BasicAuthRoot {
	pub fn configure(config: &str) -> anyhow::Result<Self> {
		let config = BasicAuthConfig::parse(config).context("basic auth configuration")?;
		let auth = BasicAuth::new(config);
		let challenge = HeaderValue::from_str(&auth.www_authenticate())
			.context("basic auth realm is not a valid header value")?;
		Ok(BasicAuthRoot { auth, challenge })
	}
}

impl RootContext for BasicAuthRoot {
	fn name(&self) -> &'static str {
		"basic_auth"
	}

	fn new_http_context(self: Arc<Self>, _context_id: u32) -> Box<dyn HttpContext> {
		Box::new(BasicAuthFilter { root: self })
	}
}

struct BasicAuthFilter {
	root: Arc<BasicAuthRoot>,
}

impl HttpContext for BasicAuthFilter {
	fn on_request_headers(&mut self, request: &mut RequestHeaders, stream: &Arc<StreamHandle>) -> Action {
		let decision = self.root.auth.check(
			request.method.as_str(),
			&request.authority,
			&request.path,
			request.header(AUTHORIZATION),
		);
		match decision {
			AuthDecision::Allow => Action::Continue,
			AuthDecision::Deny(denial) => {
				stream.send_local_reply(
					LocalReply::new(denial.status(), denial.body())
						.with_details("basic_auth_denied")
						.with_header(WWW_AUTHENTICATE, self.root.challenge.clone()),
				);
				Action::StopIteration
			},
		}
	}
}
