//! Rate limit configuration parsing
//!
//! ```json
//! { "max_tokens": 100, "tokens_per_refill": 10, "refill_interval_sec": 1 }
//! ```

use crate::limiter::DEFAULT_MAX_CAS_RETRIES;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rate limiter configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Bucket capacity; refills never go above it
    pub max_tokens: u64,

    /// Tokens added per refill. The bucket also starts with this many.
    pub tokens_per_refill: u64,

    /// Seconds between refills
    pub refill_interval_sec: u64,

    /// Compare-and-swap attempts before giving up on a contended bucket
    #[serde(default = "default_max_cas_retries")]
    pub max_cas_retries: u32,
}

fn default_max_cas_retries() -> u32 {
    DEFAULT_MAX_CAS_RETRIES
}

impl Config {
    /// Parse configuration from the filter's JSON configuration string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)
            .with_context(|| "Failed to parse rate limit config JSON")?;

        // Validate
        if config.refill_interval_sec == 0 {
            anyhow::bail!("refill_interval_sec must be greater than zero");
        }

        Ok(config)
    }

    pub fn refill_interval(&self) -> Duration {
        Duration::from_secs(self.refill_interval_sec)
    }
}
