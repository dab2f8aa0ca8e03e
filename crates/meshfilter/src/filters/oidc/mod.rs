//! OpenID Connect authorization code flow with PKCE.
//!
//! Requests without a valid session are redirected to the provider. The
//! callback exchanges the code for tokens, which are kept AES-256-GCM
//! encrypted in chunked session cookies and optionally forwarded upstream.

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use futures_util::future::BoxFuture;
use http::HeaderValue;
use http::header::{CACHE_CONTROL, CONTENT_TYPE, COOKIE, HOST, LOCATION, SET_COOKIE};
use itertools::Itertools;
use parking_lot::Mutex;
use rand::Rng;
use rand::distributions::Alphanumeric;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::form_urlencoded;

use crate::filter::{Action, HttpContext, LocalReply, RequestHeaders, RootContext};
use crate::stream::StreamHandle;

pub mod config;
pub mod discovery;
pub mod session;

#[cfg(test)]
mod fixtures;

use config::{ForwardHeader, OidcConfig};
use discovery::Provider;
use session::{AuthorizationState, SealedSession, SessionCipher};

const TICK_PERIOD: Duration = Duration::from_millis(250);
const EMPTY_KEYS_RETRY: Duration = Duration::from_secs(60);
const TOKEN_TIMEOUT: Duration = Duration::from_secs(10);
/// Longest value of one session cookie
const COOKIE_CHUNK: usize = 4000;
/// Max-Age of the cookies carrying the login flow, in seconds
const FLOW_COOKIE_AGE: u64 = 180;
const VERIFIER_LEN: usize = 128;

const NONCE_COOKIE: &str = "nonce";
const VERIFIER_COOKIE: &str = "code-verifier";
const ORIGINAL_PATH_COOKIE: &str = "original-path";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextLoad {
	Now,
	At(Instant),
	Never,
}

fn scheduled(after: Duration) -> NextLoad {
	Instant::now()
		.checked_add(after)
		.map_or(NextLoad::Never, NextLoad::At)
}

struct LoadState {
	provider: Option<Arc<Provider>>,
	loading: bool,
	next_load: NextLoad,
	/// Requests that arrived before the provider was loaded
	waiting: Vec<Waiter>,
}

struct Waiter {
	stream: Weak<StreamHandle>,
	path: String,
}

impl Waiter {
	fn release(self, reply: LocalReply) {
		if let Some(stream) = self.stream.upgrade() {
			stream.send_local_reply(reply);
			stream.continue_request();
		}
	}
}

pub struct OidcRoot {
	inner: Arc<Inner>,
}

struct Inner {
	config: OidcConfig,
	http: reqwest::Client,
	cipher: SessionCipher,
	state: Mutex<LoadState>,
}

impl OidcRoot {
	pub fn configure(config: &str, http: reqwest::Client) -> anyhow::Result<Self> {
		let config = OidcConfig::from_json(config).context("oidc configuration")?;
		let cipher = SessionCipher::new(&config.aes_key);
		let state = LoadState {
			provider: None,
			loading: false,
			next_load: NextLoad::Now,
			waiting: Vec::new(),
		};
		Ok(OidcRoot {
			inner: Arc::new(Inner {
				config,
				http,
				cipher,
				state: Mutex::new(state),
			}),
		})
	}

	pub fn is_ready(&self) -> bool {
		self.inner.state.lock().provider.is_some()
	}

	/// Load the provider now, regardless of the reload schedule.
	pub async fn refresh(&self) {
		self.inner.state.lock().loading = true;
		self.inner.load().await;
	}
}

impl RootContext for OidcRoot {
	fn name(&self) -> &'static str {
		"oidc"
	}

	fn tick_period(&self) -> Option<Duration> {
		Some(TICK_PERIOD)
	}

	fn on_tick(&self) {
		{
			let mut state = self.inner.state.lock();
			let due = match state.next_load {
				NextLoad::Now => true,
				NextLoad::At(at) => at <= Instant::now(),
				NextLoad::Never => false,
			};
			if state.loading || !due {
				return;
			}
			state.loading = true;
		}
		let inner = self.inner.clone();
		tokio::spawn(async move { inner.load().await });
	}

	fn on_done(&self) -> BoxFuture<'static, ()> {
		let waiting = std::mem::take(&mut self.inner.state.lock().waiting);
		for waiter in waiting {
			waiter.release(
				LocalReply::new(503, "OIDC provider unavailable.")
					.with_details("oidc_not_ready")
					.with_header(CACHE_CONTROL, no_cache()),
			);
		}
		Box::pin(async {})
	}

	fn new_http_context(self: Arc<Self>, _context_id: u32) -> Box<dyn HttpContext> {
		Box::new(OidcFilter {
			inner: self.inner.clone(),
		})
	}
}

impl Inner {
	/// Fetch the provider. A failed reload keeps serving the previous one.
	async fn load(&self) {
		let result = discovery::fetch_provider(&self.http, &self.config.discovery_url).await;
		let released = {
			let mut state = self.state.lock();
			state.loading = false;
			match result {
				Ok(provider) if provider.keys.keys.is_empty() => {
					warn!(issuer = %provider.issuer, "provider publishes no signing keys, retrying in 60s");
					state.next_load = scheduled(EMPTY_KEYS_RETRY);
					return;
				},
				Ok(provider) => {
					info!(issuer = %provider.issuer, keys = provider.keys.keys.len(), "provider loaded");
					state.provider = Some(Arc::new(provider));
					state.next_load = scheduled(self.config.reload_interval);
					std::mem::take(&mut state.waiting)
				},
				Err(err) => {
					warn!("failed to load provider: {err:#}");
					state.next_load = NextLoad::Now;
					return;
				},
			}
		};

		if !released.is_empty() {
			info!(requests = released.len(), "releasing requests queued before the provider loaded");
		}
		for waiter in released {
			let location = header_value_or_root(local_path(&waiter.path));
			waiter.release(
				LocalReply::new(307, "Filter is ready now.")
					.with_details("oidc_ready")
					.with_header(LOCATION, location)
					.with_header(CACHE_CONTROL, no_cache()),
			);
		}
	}

	fn authenticate(
		self: &Arc<Self>,
		request: &mut RequestHeaders,
		stream: &Arc<StreamHandle>,
		provider: Arc<Provider>,
	) -> Action {
		let host = request_host(request).to_string();
		if self.config.is_excluded(&host, &request.path) {
			debug!(stream = stream.id(), %host, path = %request.path, "excluded from authentication");
			strip_session_cookies(request, &self.config.cookie_name);
			return Action::Continue;
		}

		if request.url_path().starts_with(self.config.redirect_uri.path()) {
			return self.callback(request, stream, provider);
		}

		match self.session(request, &provider) {
			Ok(Some(state)) => {
				forward(request, self.config.access_token_header.as_ref(), &state.access_token);
				forward(request, self.config.id_token_header.as_ref(), &state.id_token);
				strip_session_cookies(request, &self.config.cookie_name);
				Action::Continue
			},
			Ok(None) => {
				debug!(stream = stream.id(), "no session, redirecting to provider");
				self.redirect(request, stream, &provider)
			},
			Err(err) => {
				warn!(stream = stream.id(), "session rejected: {err:#}");
				self.redirect(request, stream, &provider)
			},
		}
	}

	fn session(
		&self,
		request: &RequestHeaders,
		provider: &Provider,
	) -> anyhow::Result<Option<AuthorizationState>> {
		let cookies = cookies(request);
		let (Some(sealed), Some(nonce)) = (
			session_cookie(&cookies, &self.config.cookie_name),
			find_cookie(&cookies, NONCE_COOKIE),
		) else {
			return Ok(None);
		};
		let state = self.cipher.open(&sealed, nonce)?;
		if self.config.token_validation {
			provider.validate_id_token(&state.id_token, &self.config.audience)?;
		}
		Ok(Some(state))
	}

	/// Exchange the code in the background and answer with the new session.
	fn callback(
		self: &Arc<Self>,
		request: &RequestHeaders,
		stream: &Arc<StreamHandle>,
		provider: Arc<Provider>,
	) -> Action {
		let cookies = cookies(request);
		let (code, verifier) = match callback_params(request, &cookies) {
			Ok(params) => params,
			Err(err) => {
				warn!(stream = stream.id(), "token exchange failed: {err:#}");
				stream.send_local_reply(
					LocalReply::new(503, "Token exchange failed.")
						.with_details("oidc_exchange_failed")
						.with_header(CACHE_CONTROL, no_cache()),
				);
				return Action::StopIteration;
			},
		};
		let location = find_cookie(&cookies, ORIGINAL_PATH_COOKIE)
			.and_then(|c| decode_cookie(c).ok())
			.map(|path| local_path(&path).to_string())
			.unwrap_or_else(|| "/".to_string());
		let stale_chunks = session_chunks(&cookies, &self.config.cookie_name)
			.last()
			.map_or(0, |&(index, _)| index + 1);
		debug!(stream = stream.id(), "exchanging authorization code");

		let inner = self.clone();
		let requester = Arc::downgrade(stream);
		tokio::spawn(async move {
			let reply = inner
				.exchange(&provider, &code, &verifier)
				.await
				.and_then(|state| inner.session_reply(&state, &location, stale_chunks));
			let Some(stream) = requester.upgrade() else {
				return;
			};
			match reply {
				Ok(reply) => stream.send_local_reply(reply),
				Err(err) => {
					warn!(stream = stream.id(), "storing token in cookie failed: {err:#}");
					stream.send_local_reply(
						LocalReply::new(503, "Storing token in cookie failed.")
							.with_details("oidc_exchange_failed")
							.with_header(CACHE_CONTROL, no_cache()),
					);
				},
			}
			stream.continue_request();
		});
		Action::Pause
	}

	async fn exchange(
		&self,
		provider: &Provider,
		code: &str,
		verifier: &str,
	) -> anyhow::Result<AuthorizationState> {
		let body = form_urlencoded::Serializer::new(String::new())
			.append_pair("grant_type", "authorization_code")
			.append_pair("code_verifier", verifier)
			.append_pair("code", code)
			.append_pair("redirect_uri", self.config.redirect_uri.as_str())
			.finish();
		let response = self
			.http
			.post(provider.token_endpoint.clone())
			.basic_auth(&self.config.client_id, Some(&self.config.client_secret))
			.header(CONTENT_TYPE, "application/x-www-form-urlencoded")
			.body(body)
			.timeout(TOKEN_TIMEOUT)
			.send()
			.await
			.context("token endpoint unreachable")?;
		let status = response.status();
		if !status.is_success() {
			let body = response.text().await.unwrap_or_default();
			anyhow::bail!("token endpoint answered {status}: {body}");
		}
		response
			.json()
			.await
			.context("token response is not in the expected format")
	}

	fn session_reply(
		&self,
		state: &AuthorizationState,
		location: &str,
		stale_chunks: usize,
	) -> anyhow::Result<LocalReply> {
		let SealedSession { cookie, nonce } = self.cipher.seal(state)?;
		let name = &self.config.cookie_name;
		let attributes = format!("Path=/; Secure; HttpOnly; Max-Age={}", self.config.cookie_duration);

		let mut reply = LocalReply::new(307, "Redirecting...")
			.with_details("oidc_session_created")
			.with_header(LOCATION, HeaderValue::from_str(location)?);
		let chunks: Vec<&[u8]> = cookie.as_bytes().chunks(COOKIE_CHUNK).collect();
		for (i, chunk) in chunks.iter().enumerate() {
			let chunk = std::str::from_utf8(chunk)?;
			reply = reply.append_header(
				SET_COOKIE,
				HeaderValue::from_str(&format!("{name}-{i}={chunk}; {attributes}"))?,
			);
		}
		// chunks of a longer, previous session would corrupt the joined value
		for i in chunks.len()..stale_chunks {
			reply = reply.append_header(
				SET_COOKIE,
				HeaderValue::from_str(&format!("{name}-{i}=; Path=/; Max-Age=0"))?,
			);
		}
		Ok(reply.append_header(
			SET_COOKIE,
			HeaderValue::from_str(&format!("{NONCE_COOKIE}={nonce}; {attributes}"))?,
		))
	}

	fn redirect(&self, request: &RequestHeaders, stream: &StreamHandle, provider: &Provider) -> Action {
		match self.authorization_redirect(&request.path, provider) {
			Ok(reply) => stream.send_local_reply(reply),
			Err(err) => {
				warn!(stream = stream.id(), "failed to build authorization redirect: {err:#}");
				stream.send_local_reply(
					LocalReply::new(503, "Redirect to provider failed.")
						.with_header(CACHE_CONTROL, no_cache()),
				);
			},
		}
		Action::StopIteration
	}

	/// Redirect to the authorization endpoint, remembering the original path
	/// and the PKCE verifier in short-lived cookies.
	fn authorization_redirect(
		&self,
		original_path: &str,
		provider: &Provider,
	) -> anyhow::Result<LocalReply> {
		let verifier: String = rand::thread_rng()
			.sample_iter(&Alphanumeric)
			.take(VERIFIER_LEN)
			.map(char::from)
			.collect();
		let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));

		let mut location = provider.authorization_endpoint.clone();
		{
			let mut query = location.query_pairs_mut();
			query
				.append_pair("response_type", "code")
				.append_pair("code_challenge", &challenge)
				.append_pair("code_challenge_method", "S256")
				.append_pair("client_id", &self.config.client_id)
				.append_pair("redirect_uri", self.config.redirect_uri.as_str())
				.append_pair("scope", &self.config.scope);
			if !self.config.claims.is_empty() {
				query.append_pair("claims", &self.config.claims);
			}
		}

		let flow_cookie = |name: &str, value: &str| {
			HeaderValue::from_str(&format!(
				"{name}={}; Path=/; Max-Age={FLOW_COOKIE_AGE}",
				URL_SAFE_NO_PAD.encode(value)
			))
		};
		Ok(LocalReply::new(307, "Redirecting...")
			.with_details("oidc_redirect")
			.with_header(LOCATION, HeaderValue::from_str(location.as_str())?)
			.append_header(SET_COOKIE, flow_cookie(ORIGINAL_PATH_COOKIE, original_path)?)
			.append_header(SET_COOKIE, flow_cookie(VERIFIER_COOKIE, &verifier)?))
	}
}

struct OidcFilter {
	inner: Arc<Inner>,
}

impl HttpContext for OidcFilter {
	fn on_request_headers(&mut self, request: &mut RequestHeaders, stream: &Arc<StreamHandle>) -> Action {
		let provider = {
			let mut state = self.inner.state.lock();
			let provider = state.provider.clone();
			match provider {
				Some(provider) => provider,
				None => {
					warn!(stream = stream.id(), "provider not loaded yet, pausing request");
					state.waiting.push(Waiter {
						stream: Arc::downgrade(stream),
						path: request.path.clone(),
					});
					return Action::Pause;
				},
			}
		};
		self.inner.authenticate(request, stream, provider)
	}
}

fn no_cache() -> HeaderValue {
	HeaderValue::from_static("no-cache")
}

fn header_value_or_root(value: &str) -> HeaderValue {
	HeaderValue::from_str(value).unwrap_or_else(|_| HeaderValue::from_static("/"))
}

/// Only same-origin paths are redirect targets.
fn local_path(path: &str) -> &str {
	if path.starts_with('/') && !path.starts_with("//") && !path.starts_with("/\\") {
		path
	} else {
		"/"
	}
}

fn request_host(request: &RequestHeaders) -> &str {
	if !request.authority.is_empty() {
		return &request.authority;
	}
	request
		.header("x-forwarded-host")
		.or_else(|| request.header(HOST))
		.unwrap_or_default()
}

/// `name=value` pairs of every `Cookie` header, in order.
fn cookies(request: &RequestHeaders) -> Vec<(&str, &str)> {
	request
		.headers
		.get_all(COOKIE)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(';'))
		.filter_map(|c| c.trim().split_once('='))
		.map(|(name, value)| (name.trim(), value.trim()))
		.collect()
}

fn find_cookie<'a>(cookies: &[(&'a str, &'a str)], name: &str) -> Option<&'a str> {
	cookies
		.iter()
		.find(|(n, _)| *n == name)
		.map(|&(_, value)| value)
}

/// Chunks `{cookie_name}-{i}` of the session cookie, ordered by index.
fn session_chunks<'a>(cookies: &[(&'a str, &'a str)], cookie_name: &str) -> Vec<(usize, &'a str)> {
	let mut chunks: Vec<_> = cookies
		.iter()
		.filter_map(|&(name, value)| {
			let index = name.strip_prefix(cookie_name)?.strip_prefix('-')?.parse().ok()?;
			Some((index, value))
		})
		.collect();
	chunks.sort_by_key(|&(index, _)| index);
	chunks
}

fn session_cookie(cookies: &[(&str, &str)], cookie_name: &str) -> Option<String> {
	let chunks = session_chunks(cookies, cookie_name);
	if chunks.is_empty() {
		return None;
	}
	Some(chunks.into_iter().map(|(_, value)| value).collect())
}

/// Drop the proxy's own cookies before the request goes upstream.
fn strip_session_cookies(request: &mut RequestHeaders, cookie_name: &str) {
	let kept = cookies(request)
		.into_iter()
		.filter(|(name, _)| *name != NONCE_COOKIE && !name.starts_with(cookie_name))
		.map(|(name, value)| format!("{name}={value}"))
		.join("; ");
	request.headers.remove(COOKIE);
	if kept.is_empty() {
		return;
	}
	match HeaderValue::from_str(&kept) {
		Ok(value) => {
			request.headers.insert(COOKIE, value);
		},
		Err(_) => warn!("dropping cookies that are not a valid header value"),
	}
}

fn forward(request: &mut RequestHeaders, header: Option<&ForwardHeader>, token: &str) {
	let Some(header) = header else {
		return;
	};
	match HeaderValue::from_str(&format!("{}{token}", header.prefix)) {
		Ok(value) => {
			request.headers.insert(header.name.clone(), value);
		},
		Err(_) => warn!(header = %header.name, "token is not a valid header value"),
	}
}

fn decode_cookie(value: &str) -> anyhow::Result<String> {
	let bytes = URL_SAFE_NO_PAD.decode(value).context("cookie is not valid base64")?;
	String::from_utf8(bytes).context("cookie is not valid utf-8")
}

fn callback_params(request: &RequestHeaders, cookies: &[(&str, &str)]) -> anyhow::Result<(String, String)> {
	let code = request
		.path
		.split_once('?')
		.and_then(|(_, query)| {
			form_urlencoded::parse(query.as_bytes())
				.find(|(key, _)| key == "code")
				.map(|(_, value)| value.into_owned())
		})
		.context("callback without a code")?;
	let verifier = find_cookie(cookies, VERIFIER_COOKIE).context("no code verifier cookie")?;
	let verifier = decode_cookie(verifier).context("invalid code verifier cookie")?;
	Ok((code, verifier))
}
