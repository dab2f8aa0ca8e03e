//! Policy check configuration
//!
//! ```json
//! {
//!   "opa_cluster_name": "outbound|8181||opa.default.svc.cluster.local",
//!   "opa_service_host": "opa.default.svc.cluster.local",
//!   "check_result_cache_valid_sec": 10
//! }
//! ```

use crate::PolicyError;
use serde::Deserialize;
use std::time::Duration;

mod defaults {
    pub fn timeout_ms() -> u64 {
        5_000
    }
}

#[derive(Debug, Deserialize)]
struct RawPolicyConfig {
    opa_cluster_name: String,
    opa_service_host: String,
    #[serde(default)]
    check_result_cache_valid_sec: u64,
    opa_service_url: Option<String>,
    #[serde(default = "defaults::timeout_ms")]
    timeout_ms: u64,
}

/// Configuration for policy checks
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyConfig {
    /// Upstream the check is routed through
    pub cluster_name: String,
    /// `Host` header of the check request
    pub service_host: String,
    /// Base URL of the policy server
    pub service_url: String,
    /// How long a result is reused; zero disables the cache
    pub cache_valid_for: Duration,
    /// Remote call deadline
    pub timeout: Duration,
}

impl PolicyConfig {
    pub fn from_json(json: &str) -> Result<Self, PolicyError> {
        let raw: RawPolicyConfig =
            serde_json::from_str(json).map_err(|e| PolicyError::Config(e.to_string()))?;
        raw.try_into()
    }
}

impl TryFrom<RawPolicyConfig> for PolicyConfig {
    type Error = PolicyError;

    fn try_from(raw: RawPolicyConfig) -> Result<Self, Self::Error> {
        if raw.opa_cluster_name.is_empty() {
            return Err(PolicyError::Config("opa_cluster_name must not be empty".to_string()));
        }
        if raw.opa_service_host.is_empty() {
            return Err(PolicyError::Config("opa_service_host must not be empty".to_string()));
        }
        let service_url = raw
            .opa_service_url
            .unwrap_or_else(|| format!("http://{}", raw.opa_cluster_name));
        Ok(PolicyConfig {
            cluster_name: raw.opa_cluster_name,
            service_host: raw.opa_service_host,
            service_url: service_url.trim_end_matches('/').to_string(),
            cache_valid_for: Duration::from_secs(raw.check_result_cache_valid_sec),
            timeout: Duration::from_millis(raw.timeout_ms),
        })
    }
}
