//! Policy check orchestration
//!
//! Serves decisions from the [`ResultCache`] when it can and otherwise
//! suspends the request while the policy server is asked. The request is
//! resumed from the completion of the remote call.

use crate::cache::{CheckPayload, ResultCache};
use crate::client::PolicyClient;
use crate::config::PolicyConfig;
use crate::PolicyError;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, warn};

pub const DENIED_BODY: &str = "OPA policy check denied";
pub const CALL_FAILED_BODY: &str = "OPA policy check call failed";
pub const CHECK_FAILED_BODY: &str = "OPA policy check failed";

/// Source of the policy decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    /// Result cache hit
    Cache,
    /// Answered by the policy server
    Remote,
}

/// Policy decision result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Request allowed
    Allow {
        /// Where the decision came from
        source: DecisionSource,
    },
    /// Request denied
    Deny {
        /// Body of the local reply
        reason: String,
        /// HTTP status code to return
        status: u16,
        /// Where the decision came from, if the policy decided
        source: Option<DecisionSource>,
    },
}

impl PolicyDecision {
    /// Create an Allow decision
    pub fn allow(source: DecisionSource) -> Self {
        PolicyDecision::Allow { source }
    }

    /// Create a Deny decision reached by the policy
    pub fn denied(source: DecisionSource) -> Self {
        PolicyDecision::Deny {
            reason: DENIED_BODY.to_string(),
            status: 403,
            source: Some(source),
        }
    }

    /// Create a Deny decision for a check that could not be completed
    pub fn failed(reason: impl Into<String>) -> Self {
        PolicyDecision::Deny {
            reason: reason.into(),
            status: 500,
            source: None,
        }
    }

    /// Check if the decision allows the request
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow { .. })
    }

    pub fn source(&self) -> Option<DecisionSource> {
        match self {
            PolicyDecision::Allow { source } => Some(*source),
            PolicyDecision::Deny { source, .. } => *source,
        }
    }
}

/// Result of [`PolicyCheck::check`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckStatus {
    /// Decided synchronously
    Decided(PolicyDecision),
    /// A remote call is in flight; the requester will be resumed
    Suspended,
}

/// The continuation of a suspended request.
pub trait Resume: Send + Sync {
    fn resume(&self, decision: PolicyDecision);

    /// A torn down request is never resumed.
    fn is_torn_down(&self) -> bool {
        false
    }
}

/// Metrics callback trait for recording policy decisions
///
/// Implement this to integrate with your metrics system
pub trait PolicyMetrics: Send + Sync {
    /// Record a cache lookup
    fn record_cache_lookup(&self, hit: bool);
    /// Record a decision outcome
    fn record_decision(&self, outcome: &'static str);
    /// Record remote call RTT
    fn record_remote_rtt(&self, seconds: f64);
}

/// No-op metrics implementation for testing
pub struct NoopMetrics;

impl PolicyMetrics for NoopMetrics {
    fn record_cache_lookup(&self, _hit: bool) {}
    fn record_decision(&self, _outcome: &'static str) {}
    fn record_remote_rtt(&self, _seconds: f64) {}
}

/// Extract the boolean `result` of a policy server response.
pub fn parse_result(body: &[u8]) -> Result<bool, PolicyError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| PolicyError::MalformedResponse(e.to_string()))?;
    value
        .get("result")
        .and_then(serde_json::Value::as_bool)
        .ok_or_else(|| PolicyError::MalformedResponse("missing boolean 'result'".to_string()))
}

/// Policy check with a shared result cache
#[derive(Clone)]
pub struct PolicyCheck {
    config: PolicyConfig,
    cache: Arc<Mutex<ResultCache>>,
    client: Arc<dyn PolicyClient>,
    metrics: Arc<dyn PolicyMetrics>,
}

impl PolicyCheck {
    pub fn new(config: PolicyConfig, client: Arc<dyn PolicyClient>) -> Self {
        Self::with_metrics(config, client, Arc::new(NoopMetrics))
    }

    pub fn with_metrics(
        config: PolicyConfig,
        client: Arc<dyn PolicyClient>,
        metrics: Arc<dyn PolicyMetrics>,
    ) -> Self {
        let cache = ResultCache::new(config.cache_valid_for);
        Self {
            config,
            cache: Arc::new(Mutex::new(cache)),
            client,
            metrics,
        }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Number of cached results
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }

    /// Check a request.
    ///
    /// On a cache miss the remote call runs on the current tokio runtime and
    /// `requester` is resumed with its outcome, unless it has been dropped or
    /// torn down by then.
    pub fn check(&self, payload: &CheckPayload, requester: Weak<dyn Resume>) -> CheckStatus {
        let hash = payload.fingerprint();
        let cached = self.cache.lock().check(hash, Instant::now());
        self.metrics.record_cache_lookup(cached.is_some());

        match cached {
            Some(true) => {
                debug!(hash, "policy cache hit: allow");
                self.metrics.record_decision("allow_cache");
                CheckStatus::Decided(PolicyDecision::allow(DecisionSource::Cache))
            }
            Some(false) => {
                debug!(hash, "policy cache hit: deny");
                self.metrics.record_decision("deny_cache");
                CheckStatus::Decided(PolicyDecision::denied(DecisionSource::Cache))
            }
            None => self.dispatch(payload, hash, requester),
        }
    }

    fn dispatch(&self, payload: &CheckPayload, hash: u64, requester: Weak<dyn Resume>) -> CheckStatus {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(hash, error = %PolicyError::NoRuntime, "cannot dispatch policy check");
                self.metrics.record_decision("deny_dispatch");
                return CheckStatus::Decided(PolicyDecision::failed(CALL_FAILED_BODY));
            }
        };
        let call = match self.client.dispatch(payload) {
            Ok(call) => call,
            Err(e) => {
                warn!(hash, error = %e, "cannot dispatch policy check");
                self.metrics.record_decision("deny_dispatch");
                return CheckStatus::Decided(PolicyDecision::failed(CALL_FAILED_BODY));
            }
        };

        let cache = self.cache.clone();
        let metrics = self.metrics.clone();
        let timeout = self.config.timeout;
        runtime.spawn(async move {
            let start = Instant::now();
            let result = match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(PolicyError::Timeout(timeout)),
            };
            metrics.record_remote_rtt(start.elapsed().as_secs_f64());

            let decision = complete(result, hash, &cache, metrics.as_ref());
            match requester.upgrade() {
                Some(r) if !r.is_torn_down() => r.resume(decision),
                _ => debug!(hash, "request finished before the policy check completed"),
            }
        });

        CheckStatus::Suspended
    }
}

fn complete(
    result: Result<Bytes, PolicyError>,
    hash: u64,
    cache: &Mutex<ResultCache>,
    metrics: &dyn PolicyMetrics,
) -> PolicyDecision {
    let allowed = match result.and_then(|body| parse_result(&body)) {
        Ok(allowed) => allowed,
        Err(e) => {
            warn!(hash, error = %e, "policy check failed");
            metrics.record_decision("deny_error");
            return PolicyDecision::failed(CHECK_FAILED_BODY);
        }
    };

    cache.lock().add(hash, allowed, Instant::now());
    if allowed {
        debug!(hash, "policy check: allow");
        metrics.record_decision("allow_remote");
        PolicyDecision::allow(DecisionSource::Remote)
    } else {
        debug!(hash, "policy check: deny");
        metrics.record_decision("deny_remote");
        PolicyDecision::denied(DecisionSource::Remote)
    }
}
