use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use tracing::debug;
use url::Url;

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
	issuer: String,
	authorization_endpoint: String,
	token_endpoint: String,
	jwks_uri: String,
}

/// Endpoints and signing keys of the OpenID provider.
#[derive(Debug, Clone)]
pub struct Provider {
	pub issuer: String,
	pub authorization_endpoint: Url,
	pub token_endpoint: Url,
	pub keys: JwkSet,
}

/// Load the discovery document, then the key set it points to.
pub async fn fetch_provider(http: &reqwest::Client, discovery: &Url) -> anyhow::Result<Provider> {
	let document: DiscoveryDocument = http
		.get(discovery.clone())
		.timeout(FETCH_TIMEOUT)
		.send()
		.await
		.and_then(|r| r.error_for_status())
		.with_context(|| format!("failed to fetch discovery document from {discovery}"))?
		.json()
		.await
		.context("invalid discovery document")?;

	let authorization_endpoint = Url::parse(&document.authorization_endpoint)
		.context("invalid authorization_endpoint")?;
	let token_endpoint = Url::parse(&document.token_endpoint).context("invalid token_endpoint")?;

	let keys: JwkSet = http
		.get(&document.jwks_uri)
		.timeout(FETCH_TIMEOUT)
		.send()
		.await
		.and_then(|r| r.error_for_status())
		.with_context(|| format!("failed to fetch signing keys from {}", document.jwks_uri))?
		.json()
		.await
		.context("invalid signing key set")?;
	debug!(issuer = %document.issuer, keys = keys.keys.len(), "fetched provider");

	Ok(Provider {
		issuer: document.issuer,
		authorization_endpoint,
		token_endpoint,
		keys,
	})
}

impl Provider {
	/// Check the signature, issuer, audience and expiry of an ID token.
	/// Keys with a matching `kid` are tried; a token without `kid` tries all keys.
	pub fn validate_id_token(&self, token: &str, audience: &str) -> anyhow::Result<()> {
		let header = decode_header(token).context("id token is not a JWT")?;
		if !matches!(
			header.alg,
			Algorithm::RS256
				| Algorithm::RS384
				| Algorithm::RS512
				| Algorithm::PS256
				| Algorithm::PS384
				| Algorithm::PS512
				| Algorithm::ES256
				| Algorithm::ES384
		) {
			bail!("id token signed with unsupported algorithm {:?}", header.alg);
		}

		let mut validation = Validation::new(header.alg);
		validation.set_issuer(&[&self.issuer]);
		validation.set_audience(&[audience]);

		let mut last_err = None;
		let candidates = self
			.keys
			.keys
			.iter()
			.filter(|jwk| header.kid.is_none() || jwk.common.key_id == header.kid);
		for jwk in candidates {
			let result = DecodingKey::from_jwk(jwk)
				.and_then(|key| decode::<serde_json::Value>(token, &key, &validation));
			match result {
				Ok(_) => return Ok(()),
				Err(err) => last_err = Some(err),
			}
		}
		match last_err {
			Some(err) => Err(anyhow::Error::new(err).context("id token rejected")),
			None => Err(anyhow!("no signing key matches the id token")),
		}
	}
}

#[cfg(test)]
mod tests {
	use wiremock::MockServer;

	use super::*;
	use crate::filters::oidc::fixtures;

	#[tokio::test]
	async fn test_fetch_provider() {
		let server = MockServer::start().await;
		fixtures::mount_provider(&server).await;
		let discovery = Url::parse(&format!("{}/.well-known/openid-configuration", server.uri())).unwrap();

		let provider = fetch_provider(&reqwest::Client::new(), &discovery).await.unwrap();
		assert_eq!(provider.issuer, fixtures::ISSUER);
		assert_eq!(provider.authorization_endpoint.path(), "/auth");
		assert_eq!(provider.token_endpoint.path(), "/token");
		assert_eq!(provider.keys.keys.len(), 1);
	}

	#[tokio::test]
	async fn test_fetch_fails_on_missing_document() {
		let server = MockServer::start().await;
		let discovery = Url::parse(&format!("{}/.well-known/openid-configuration", server.uri())).unwrap();
		assert!(fetch_provider(&reqwest::Client::new(), &discovery).await.is_err());
	}

	#[test]
	fn test_validate_id_token() {
		let provider = fixtures::provider("http://idp.test");
		let token = fixtures::id_token(fixtures::ISSUER, fixtures::CLIENT_ID);
		provider.validate_id_token(&token, fixtures::CLIENT_ID).unwrap();

		assert!(provider.validate_id_token(&token, "other-client").is_err());
		let foreign = fixtures::id_token("https://evil.example.com", fixtures::CLIENT_ID);
		assert!(provider.validate_id_token(&foreign, fixtures::CLIENT_ID).is_err());
		assert!(provider.validate_id_token("not.a.jwt", fixtures::CLIENT_ID).is_err());

		let mut unsigned = token.rsplit_once('.').unwrap().0.to_string();
		unsigned.push_str(".c2lnbmF0dXJl");
		assert!(provider.validate_id_token(&unsigned, fixtures::CLIENT_ID).is_err());
	}

	#[test]
	fn test_unknown_kid_is_rejected() {
		let mut provider = fixtures::provider("http://idp.test");
		provider.keys.keys[0].common.key_id = Some("rotated".to_string());
		let token = fixtures::id_token(fixtures::ISSUER, fixtures::CLIENT_ID);
		let err = provider.validate_id_token(&token, fixtures::CLIENT_ID).unwrap_err();
		assert_eq!(err.to_string(), "no signing key matches the id token");
	}
}
