//! ratelimit-core: Distributed token bucket rate limiting
//!
//! A single token bucket is shared by every worker through a versioned
//! key/value store ([`SharedData`]). Requests take one token each; a periodic
//! refill adds tokens up to a cap. All updates are optimistic
//! compare-and-swap retries, so no update is ever lost between workers.
//!
//! # Example
//!
//! ```rust,ignore
//! use ratelimit_core::{Config, InMemorySharedData, RateLimiter, RequestInfo};
//! use std::sync::Arc;
//!
//! let config = Config::from_json(
//!     r#"{"max_tokens": 100, "tokens_per_refill": 10, "refill_interval_sec": 1}"#,
//! )?;
//! let limiter = RateLimiter::new(config, Arc::new(InMemorySharedData::new()));
//! limiter.initialize()?;
//!
//! let decision = limiter.check(&RequestInfo { method: "GET", host: "example.com", path: "/" });
//! if !decision.is_allowed() {
//!     // 429 Too many requests
//! }
//!
//! // once per refill interval
//! limiter.on_tick();
//! ```

pub mod config;
pub mod limiter;
pub mod shared;

// Re-export public types
pub use config::Config;
pub use limiter::{
    RateLimitPredicate, RateLimiter, RefillOutcome, RequestInfo, TokenBucket,
    DEFAULT_MAX_CAS_RETRIES, LAST_REFILLED_KEY, TOKEN_BUCKET_KEY,
};
pub use shared::{InMemorySharedData, SharedData, SharedDataError};

use std::time::Duration;
use thiserror::Error;

/// Body of the local reply sent for a rate limited request
pub const RATE_LIMITED_BODY: &str = "Too many requests";
/// Response details recorded for a rate limited request
pub const RATE_LIMITED_DETAILS: &str = "rate_limited";

/// Rate limit decision result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Request allowed
    Allow,
    /// Request rate limited (HTTP 429)
    LimitExceeded {
        /// Upper bound on the time until tokens are added again
        retry_after: Duration,
    },
}

impl RateLimitDecision {
    /// Create a LimitExceeded decision
    pub fn limit_exceeded(retry_after: Duration) -> Self {
        RateLimitDecision::LimitExceeded { retry_after }
    }

    /// Check if the request is allowed
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allow)
    }

    /// HTTP status of the local reply for a denial
    pub fn status(&self) -> Option<u16> {
        match self {
            RateLimitDecision::Allow => None,
            RateLimitDecision::LimitExceeded { .. } => Some(429),
        }
    }
}

/// Error type for rate limit operations
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Shared data error: {0}")]
    SharedData(#[from] SharedDataError),
}
