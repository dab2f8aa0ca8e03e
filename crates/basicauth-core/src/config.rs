//! Basic auth rule table parsing
//!
//! ```json
//! {
//!   "realm": "internal",
//!   "basic_auth_rules": [
//!     {
//!       "prefix": "/api",
//!       "hosts": ["*.example.com"],
//!       "request_methods": ["GET", "POST"],
//!       "credentials": ["admin:secret", "dXNlcjpwYXNz"]
//!     }
//!   ]
//! }
//! ```

use crate::matcher::{MatchKind, MatchRule};
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

pub const DEFAULT_REALM: &str = "istio";

/// Accepts pre-encoded credentials with or without trailing `=`.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot parse basic auth configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("exactly one of 'prefix', 'suffix' and 'exact' has to be present in rule {rule}")]
    PathPattern { rule: usize },

    #[error("request path pattern in rule {rule} must not be empty")]
    EmptyPath { rule: usize },

    #[error("at least one request method has to be configured in rule {rule}")]
    NoMethods { rule: usize },

    #[error("at least one credential has to be configured in rule {rule}")]
    NoCredentials { rule: usize },

    #[error("credential {index} in rule {rule} is neither user:pass nor base64 encoded")]
    InvalidCredential { rule: usize, index: usize },
}

#[derive(Debug, Default, Deserialize)]
struct RawBasicAuthConfig {
    realm: Option<String>,
    #[serde(default)]
    basic_auth_rules: Vec<RawRule>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    prefix: Option<String>,
    exact: Option<String>,
    suffix: Option<String>,
    #[serde(default)]
    hosts: Vec<String>,
    #[serde(default)]
    request_methods: Vec<String>,
    #[serde(default)]
    credentials: Vec<String>,
}

/// Rules keyed by request method, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicAuthConfig {
    pub realm: String,
    pub rules: HashMap<String, Vec<MatchRule>>,
}

impl BasicAuthConfig {
    /// Parse and validate the rule table. An empty string yields a table with
    /// no restrictions.
    pub fn parse(config: &str) -> Result<Self, ConfigError> {
        if config.trim().is_empty() {
            return Ok(Self {
                realm: DEFAULT_REALM.to_string(),
                rules: HashMap::new(),
            });
        }

        let raw: RawBasicAuthConfig = serde_json::from_str(config)?;
        let mut rules: HashMap<String, Vec<MatchRule>> = HashMap::new();

        for (idx, raw_rule) in raw.basic_auth_rules.into_iter().enumerate() {
            let (request_path, path_pattern) = path_pattern(&raw_rule, idx)?;

            if raw_rule.request_methods.is_empty() {
                return Err(ConfigError::NoMethods { rule: idx });
            }
            if raw_rule.credentials.is_empty() {
                return Err(ConfigError::NoCredentials { rule: idx });
            }

            let encoded_credentials = raw_rule
                .credentials
                .iter()
                .enumerate()
                .map(|(index, credential)| {
                    encode_credential(credential)
                        .ok_or(ConfigError::InvalidCredential { rule: idx, index })
                })
                .collect::<Result<HashSet<_>, _>>()?;

            let rule = MatchRule {
                request_path,
                path_pattern,
                hosts: raw_rule
                    .hosts
                    .iter()
                    .map(|h| MatchKind::classify_host(h))
                    .collect(),
                encoded_credentials,
            };

            for method in raw_rule.request_methods {
                rules.entry(method).or_default().push(rule.clone());
            }
        }

        Ok(Self {
            realm: raw.realm.unwrap_or_else(|| DEFAULT_REALM.to_string()),
            rules,
        })
    }
}

fn path_pattern(rule: &RawRule, idx: usize) -> Result<(String, MatchKind), ConfigError> {
    let candidates = [
        (rule.prefix.as_ref(), MatchKind::Prefix),
        (rule.exact.as_ref(), MatchKind::Exact),
        (rule.suffix.as_ref(), MatchKind::Suffix),
    ];
    let mut present = candidates
        .into_iter()
        .filter_map(|(path, kind)| path.map(|p| (p, kind)));

    let (path, kind) = match (present.next(), present.next()) {
        (Some(only), None) => only,
        _ => return Err(ConfigError::PathPattern { rule: idx }),
    };
    if path.is_empty() {
        return Err(ConfigError::EmptyPath { rule: idx });
    }
    Ok((path.clone(), kind))
}

/// `user:pass` is encoded; anything else must already be valid base64.
fn encode_credential(credential: &str) -> Option<String> {
    if credential.contains(':') {
        return Some(STANDARD.encode(credential));
    }
    match LENIENT.decode(credential) {
        Ok(decoded) if !decoded.is_empty() => Some(credential.to_string()),
        _ => None,
    }
}
