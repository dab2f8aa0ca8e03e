//! authz-core: Remote policy checks with a local result cache
//!
//! Requests are described by a [`CheckPayload`] and checked against an OPA
//! policy server. Results are kept in a bounded LRU cache for a configurable
//! time. A cache miss suspends the request; it is resumed through [`Resume`]
//! once the policy server answers.
//!
//! # Features
//!
//! - **Result cache**: LRU + TTL, bounded to [`MAX_NUM_ENTRY`] results
//! - **Async check**: the remote call runs on the tokio runtime and the
//!   request is resumed from its completion
//! - **Fail-closed**: dispatch failures, transport errors, timeouts and
//!   malformed answers all deny with HTTP 500
//!
//! # Example
//!
//! ```rust,ignore
//! use authz_core::{CheckStatus, HttpPolicyClient, PolicyCheck, PolicyConfig};
//! use std::sync::Arc;
//!
//! let config = PolicyConfig::from_json(config_json)?;
//! let client = HttpPolicyClient::new(reqwest::Client::new(), &config);
//! let check = PolicyCheck::new(config, Arc::new(client));
//!
//! match check.check(&payload, Arc::downgrade(&stream)) {
//!     CheckStatus::Decided(decision) => apply(decision),
//!     CheckStatus::Suspended => { /* stream.resume() is called later */ }
//! }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod decision;

// Re-export public types
pub use cache::{CheckPayload, ResultCache, MAX_NUM_ENTRY};
pub use client::{HttpPolicyClient, PolicyClient, PolicyFuture, POLICY_PATH};
pub use config::PolicyConfig;
pub use decision::{
    parse_result, CheckStatus, DecisionSource, NoopMetrics, PolicyCheck,
    PolicyDecision, PolicyMetrics, Resume, CALL_FAILED_BODY, CHECK_FAILED_BODY, DENIED_BODY,
};

use std::time::Duration;
use thiserror::Error;

/// Error type for policy check operations
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("invalid policy check configuration: {0}")]
    Config(String),

    #[error("failed to encode policy check request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("policy check request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("policy server returned status {0}")]
    Status(u16),

    #[error("policy check timed out after {0:?}")]
    Timeout(Duration),

    #[error("no async runtime to run the policy check on")]
    NoRuntime,

    #[error("malformed policy response: {0}")]
    MalformedResponse(String),
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cache::{CheckPayload, ResultCache};
    pub use crate::client::{HttpPolicyClient, PolicyClient};
    pub use crate::config::PolicyConfig;
    pub use crate::decision::{CheckStatus, PolicyCheck, PolicyDecision, Resume};
}
