use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use http::{HeaderName, HeaderValue};
use serde::Deserialize;

use crate::filter::{Action, HttpContext, ResponseHeaders, RootContext};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResponseHeaderConfig {
	#[serde(default)]
	headers: BTreeMap<String, String>,
}

/// Adds fixed headers to every response.
pub struct ResponseHeaderRoot {
	headers: Vec<(HeaderName, HeaderValue)>,
}

impl ResponseHeaderRoot {
	pub fn configure(config: &str) -> anyhow::Result<Self> {
		let raw: RawResponseHeaderConfig = if config.trim().is_empty() {
			RawResponseHeaderConfig::default()
		} else {
			serde_json::from_str(config).context("response header configuration")?
		};
		let mut raw = raw.headers;
		if raw.is_empty() {
			raw.insert("X-Wasm-custom".to_string(), "foo".to_string());
		}
		let headers = raw
			.into_iter()
			.map(|(name, value)| -> anyhow::Result<(HeaderName, HeaderValue)> {
				let name = HeaderName::try_from(name.as_str())
					.with_context(|| format!("invalid header name {name:?}"))?;
				let value = HeaderValue::try_from(value.as_str())
					.with_context(|| format!("invalid value for header {name}"))?;
				Ok((name, value))
			})
			.collect::<anyhow::Result<Vec<_>>>()?;
		Ok(ResponseHeaderRoot { headers })
	}
}

impl RootContext for ResponseHeaderRoot {
	fn name(&self) -> &'static str {
		"response_header"
	}

	fn new_http_context(self: Arc<Self>, _context_id: u32) -> Box<dyn HttpContext> {
		Box::new(ResponseHeaderFilter { root: self })
	}
}

struct ResponseHeaderFilter {
	root: Arc<ResponseHeaderRoot>,
}

impl HttpContext for ResponseHeaderFilter {
	fn on_response_headers(&mut self, response: &mut ResponseHeaders) -> Action {
		for (name, value) in &self.root.headers {
			response.headers.insert(name.clone(), value.clone());
		}
		Action::Continue
	}
}
