use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{Context, anyhow, bail};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

const NONCE_LEN: usize = 12;

/// Token endpoint response, kept encrypted in the session cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationState {
	pub access_token: String,
	pub token_type: String,
	/// Seconds until the access token expires
	pub expires_in: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub refresh_token: Option<String>,
	/// ID token in JWT format
	pub id_token: String,
}

/// Encrypted session and its nonce, both base64url without padding.
#[derive(Debug, Clone)]
pub struct SealedSession {
	pub cookie: String,
	pub nonce: String,
}

pub struct SessionCipher(Aes256Gcm);

impl SessionCipher {
	pub fn new(key: &[u8; 32]) -> Self {
		SessionCipher(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)))
	}

	/// Encrypt under a fresh random nonce.
	pub fn seal(&self, state: &AuthorizationState) -> anyhow::Result<SealedSession> {
		let plain = serde_json::to_vec(state).context("failed to encode session")?;
		let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
		let sealed = self
			.0
			.encrypt(&nonce, plain.as_slice())
			.map_err(|_| anyhow!("failed to encrypt session"))?;
		Ok(SealedSession {
			cookie: URL_SAFE_NO_PAD.encode(sealed),
			nonce: URL_SAFE_NO_PAD.encode(nonce),
		})
	}

	/// Decrypt a session. Any modification of the cookie or nonce fails authentication.
	pub fn open(&self, cookie: &str, nonce: &str) -> anyhow::Result<AuthorizationState> {
		let nonce = URL_SAFE_NO_PAD
			.decode(nonce)
			.context("nonce is not valid base64")?;
		if nonce.len() != NONCE_LEN {
			bail!("nonce must be {NONCE_LEN} bytes, got {}", nonce.len());
		}
		let sealed = URL_SAFE_NO_PAD
			.decode(cookie)
			.context("session cookie is not valid base64")?;
		let plain = self
			.0
			.decrypt(Nonce::from_slice(&nonce), sealed.as_slice())
			.map_err(|_| anyhow!("session cookie failed authentication"))?;
		serde_json::from_slice(&plain).context("session cookie has an unexpected format")
	}
}
