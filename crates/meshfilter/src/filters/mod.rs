use std::fmt;
use std::sync::Arc;

use ratelimit_core::SharedData;
use serde::Deserialize;

use crate::filter::RootContext;
use crate::telemetry::metrics::Metrics;

pub mod access_log;
pub mod basic_auth;
pub mod local_rate_limit;
pub mod oidc;
pub mod open_policy_agent;
pub mod response_header;
pub mod waf_sqli;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
	BasicAuth,
	LocalRateLimit,
	OpenPolicyAgent,
	WafSqli,
	ResponseHeader,
	AccessLog,
	Oidc,
}

impl FilterKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			FilterKind::BasicAuth => "basic_auth",
			FilterKind::LocalRateLimit => "local_rate_limit",
			FilterKind::OpenPolicyAgent => "open_policy_agent",
			FilterKind::WafSqli => "waf_sqli",
			FilterKind::ResponseHeader => "response_header",
			FilterKind::AccessLog => "access_log",
			FilterKind::Oidc => "oidc",
		}
	}
}

impl fmt::Display for FilterKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Host resources shared by every worker.
#[derive(Clone)]
pub struct HostServices {
	pub shared_data: Arc<dyn SharedData>,
	pub http: reqwest::Client,
	pub metrics: Arc<Metrics>,
}

/// Build the root context of one filter from its configuration string.
/// An error refuses activation of the whole chain.
pub fn configure(
	kind: FilterKind,
	config: &str,
	services: &HostServices,
) -> anyhow::Result<Arc<dyn RootContext>> {
	Ok(match kind {
		FilterKind::BasicAuth => Arc::new(basic_auth::BasicAuthRoot::configure(config)?),
		FilterKind::LocalRateLimit => Arc::new(local_rate_limit::RateLimitRoot::configure(
			config,
			services.shared_data.clone(),
		)?),
		FilterKind::OpenPolicyAgent => Arc::new(open_policy_agent::PolicyRoot::configure(
			config,
			services.http.clone(),
			services.metrics.clone(),
		)?),
		FilterKind::WafSqli => Arc::new(waf_sqli::WafRoot::configure(config)?),
		FilterKind::ResponseHeader => {
			Arc::new(response_header::ResponseHeaderRoot::configure(config)?)
		},
		FilterKind::AccessLog => Arc::new(access_log::AccessLogRoot::configure(
			config,
			services.http.clone(),
		)?),
		FilterKind::Oidc => Arc::new(oidc::OidcRoot::configure(config, services.http.clone())?),
	})
}
