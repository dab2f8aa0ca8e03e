use std::time::Duration;

use anyhow::{Context, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use http::HeaderName;
use regex::Regex;
use serde::Deserialize;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
struct RawOidcConfig {
	config_endpoint: String,
	reload_interval_in_h: u64,
	#[serde(default)]
	exclude_hosts: Vec<String>,
	#[serde(default)]
	exclude_paths: Vec<String>,
	#[serde(default)]
	exclude_urls: Vec<String>,
	access_token_header_name: Option<String>,
	access_token_header_prefix: Option<String>,
	id_token_header_name: Option<String>,
	id_token_header_prefix: Option<String>,
	cookie_name: String,
	cookie_duration: u64,
	token_validation: bool,
	aes_key: String,
	authority: String,
	redirect_uri: String,
	client_id: String,
	scope: String,
	#[serde(default)]
	claims: String,
	client_secret: String,
	audience: String,
}

/// Request header a token is copied into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardHeader {
	pub name: HeaderName,
	pub prefix: String,
}

#[derive(Debug, Clone)]
pub struct OidcConfig {
	/// Provider discovery document
	pub discovery_url: Url,
	pub reload_interval: Duration,
	pub exclude_hosts: Vec<Regex>,
	pub exclude_paths: Vec<Regex>,
	/// Matched against `{host}{path}`
	pub exclude_urls: Vec<Regex>,
	pub access_token_header: Option<ForwardHeader>,
	pub id_token_header: Option<ForwardHeader>,
	/// Prefix of the session cookie chunks `{cookie_name}-{i}`
	pub cookie_name: String,
	/// Max-Age of the session cookies, in seconds
	pub cookie_duration: u64,
	pub token_validation: bool,
	pub aes_key: [u8; 32],
	pub redirect_uri: Url,
	pub client_id: String,
	pub client_secret: String,
	pub scope: String,
	pub claims: String,
	pub audience: String,
}

impl OidcConfig {
	pub fn from_json(config: &str) -> anyhow::Result<Self> {
		let raw: RawOidcConfig = serde_json::from_str(config).context("invalid oidc configuration")?;

		if raw.reload_interval_in_h == 0 {
			bail!("reload_interval_in_h must be at least 1");
		}
		let reload_interval = raw
			.reload_interval_in_h
			.checked_mul(3600)
			.map(Duration::from_secs)
			.unwrap_or(Duration::MAX);

		if raw.cookie_name.is_empty() {
			bail!("cookie_name must not be empty");
		}

		let aes_key = STANDARD
			.decode(raw.aes_key.trim())
			.context("aes_key is not valid base64")?;
		let aes_key: [u8; 32] = aes_key
			.try_into()
			.map_err(|key: Vec<u8>| anyhow::anyhow!("aes_key must be 32 bytes, got {}", key.len()))?;

		let redirect_uri = Url::parse(&raw.redirect_uri)
			.with_context(|| format!("invalid redirect_uri {:?}", raw.redirect_uri))?;

		Ok(OidcConfig {
			discovery_url: discovery_url(&raw.config_endpoint, &raw.authority)?,
			reload_interval,
			exclude_hosts: compile(&raw.exclude_hosts).context("exclude_hosts")?,
			exclude_paths: compile(&raw.exclude_paths).context("exclude_paths")?,
			exclude_urls: compile(&raw.exclude_urls).context("exclude_urls")?,
			access_token_header: forward_header(
				raw.access_token_header_name,
				raw.access_token_header_prefix,
			)?,
			id_token_header: forward_header(raw.id_token_header_name, raw.id_token_header_prefix)?,
			cookie_name: raw.cookie_name,
			cookie_duration: raw.cookie_duration,
			token_validation: raw.token_validation,
			aes_key,
			redirect_uri,
			client_id: raw.client_id,
			client_secret: raw.client_secret,
			scope: raw.scope,
			claims: raw.claims,
			audience: raw.audience,
		})
	}

	pub fn is_excluded(&self, host: &str, path: &str) -> bool {
		if self.exclude_hosts.iter().any(|r| r.is_match(host)) {
			return true;
		}
		if self.exclude_paths.iter().any(|r| r.is_match(path)) {
			return true;
		}
		if self.exclude_urls.is_empty() {
			return false;
		}
		let url = format!("{host}{path}");
		self.exclude_urls.iter().any(|r| r.is_match(&url))
	}
}

// An absolute endpoint is used as is; a path is resolved against the authority.
fn discovery_url(endpoint: &str, authority: &str) -> anyhow::Result<Url> {
	if let Ok(url) = Url::parse(endpoint) {
		if url.has_host() {
			return Ok(url);
		}
	}
	Url::parse(&format!("http://{authority}{endpoint}"))
		.with_context(|| format!("invalid config_endpoint {endpoint:?} for authority {authority:?}"))
}

fn compile(patterns: &[String]) -> anyhow::Result<Vec<Regex>> {
	patterns
		.iter()
		.map(|p| Regex::new(p).with_context(|| format!("invalid pattern {p:?}")))
		.collect()
}

fn forward_header(
	name: Option<String>,
	prefix: Option<String>,
) -> anyhow::Result<Option<ForwardHeader>> {
	let Some(name) = name.filter(|n| !n.is_empty()) else {
		return Ok(None);
	};
	let name = HeaderName::from_bytes(name.as_bytes())
		.with_context(|| format!("invalid header name {name:?}"))?;
	Ok(Some(ForwardHeader {
		name,
		prefix: prefix.unwrap_or_default(),
	}))
}
