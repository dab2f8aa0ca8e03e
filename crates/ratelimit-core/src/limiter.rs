//! Token bucket rate limiter implementation
//!
//! The bucket lives in [`SharedData`] so every worker draws from the same
//! tokens. All updates are compare-and-swap retries; nothing is locked.

use crate::config::Config;
use crate::shared::{decode_u64, encode_u64, SharedData, SharedDataError};
use crate::{RateLimitDecision, RateLimitError};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Shared key holding the number of tokens left
pub const TOKEN_BUCKET_KEY: &str = "wasm_local_rate_limit.token_bucket";
/// Shared key holding the last refill time in nanoseconds since the epoch
pub const LAST_REFILLED_KEY: &str = "wasm_local_rate_limit.last_refilled";

pub const DEFAULT_MAX_CAS_RETRIES: u32 = 64;

/// What a refill attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefillOutcome {
    /// The refill interval has not elapsed yet
    NotDue,
    /// Another worker claimed this refill window
    ClaimedElsewhere,
    Refilled { tokens: u64 },
    /// The store failed or retries ran out; the window is lost
    Failed,
}

/// Token bucket stored in a shared, versioned key/value store
#[derive(Clone)]
pub struct TokenBucket {
    store: Arc<dyn SharedData>,
    max_cas_retries: u32,
}

impl fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucket")
            .field("max_cas_retries", &self.max_cas_retries)
            .finish_non_exhaustive()
    }
}

impl TokenBucket {
    pub fn new(store: Arc<dyn SharedData>) -> Self {
        Self {
            store,
            max_cas_retries: DEFAULT_MAX_CAS_RETRIES,
        }
    }

    pub fn with_max_cas_retries(mut self, retries: u32) -> Self {
        self.max_cas_retries = retries;
        self
    }

    /// Seed the shared keys. Safe to call from every worker: the first
    /// creator wins and later calls leave the bucket untouched.
    pub fn initialize(&self, initial_tokens: u64) -> Result<(), RateLimitError> {
        // Already initialized by another worker
        if self.store.get(LAST_REFILLED_KEY)?.is_some() {
            return Ok(());
        }

        for (key, value) in [(LAST_REFILLED_KEY, 0), (TOKEN_BUCKET_KEY, initial_tokens)] {
            match self.store.set(key, &encode_u64(value), None) {
                // Lost the create race, someone else seeded it
                Ok(()) | Err(SharedDataError::CasMismatch) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Take one token. Any store error, a missing bucket or exhausted
    /// retries deny the request.
    pub fn try_acquire(&self) -> bool {
        for _ in 0..=self.max_cas_retries {
            // Read current tokens
            let (bytes, cas) = match self.store.get(TOKEN_BUCKET_KEY) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    warn!("token bucket is not initialized");
                    return false;
                }
                Err(e) => {
                    warn!(error = %e, "failed to read token bucket");
                    return false;
                }
            };
            let tokens = match decode_u64(&bytes) {
                Ok(tokens) => tokens,
                Err(e) => {
                    warn!(error = %e, "failed to decode token bucket");
                    return false;
                }
            };

            // Over limit - no tokens available
            if tokens == 0 {
                return false;
            }

            // Try to store the decremented count
            match self
                .store
                .set(TOKEN_BUCKET_KEY, &encode_u64(tokens - 1), Some(cas))
            {
                Ok(()) => return true,
                Err(SharedDataError::CasMismatch) => continue,
                Err(e) => {
                    warn!(error = %e, "failed to update token bucket");
                    return false;
                }
            }
        }

        warn!(
            retries = self.max_cas_retries,
            "token bucket contention, giving up"
        );
        false
    }

    /// Refill using the current wall clock.
    pub fn refill(
        &self,
        tokens_per_refill: u64,
        interval: Duration,
        max_tokens: u64,
    ) -> RefillOutcome {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        self.refill_at(now, tokens_per_refill, interval, max_tokens)
    }

    /// Add `tokens_per_refill` tokens, capped at `max_tokens`, if at least
    /// `interval` has passed since the last refill. Only one caller per
    /// window wins the claim on the timestamp.
    pub fn refill_at(
        &self,
        now_nanos: u64,
        tokens_per_refill: u64,
        interval: Duration,
        max_tokens: u64,
    ) -> RefillOutcome {
        // Claim the refill window
        let (bytes, cas) = match self.store.get(LAST_REFILLED_KEY) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                warn!("token bucket is not initialized");
                return RefillOutcome::Failed;
            }
            Err(e) => {
                warn!(error = %e, "failed to read last refill time");
                return RefillOutcome::Failed;
            }
        };
        let last_refilled = match decode_u64(&bytes) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "failed to decode last refill time");
                return RefillOutcome::Failed;
            }
        };

        let interval_nanos = interval.as_nanos().min(u64::MAX as u128) as u64;
        if now_nanos.saturating_sub(last_refilled) < interval_nanos {
            return RefillOutcome::NotDue;
        }

        match self
            .store
            .set(LAST_REFILLED_KEY, &encode_u64(now_nanos), Some(cas))
        {
            Ok(()) => {}
            Err(SharedDataError::CasMismatch) => return RefillOutcome::ClaimedElsewhere,
            Err(e) => {
                warn!(error = %e, "failed to claim refill window");
                return RefillOutcome::Failed;
            }
        }

        // Add tokens
        for _ in 0..=self.max_cas_retries {
            let (bytes, cas) = match self.store.get(TOKEN_BUCKET_KEY) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    warn!("token bucket is not initialized");
                    return RefillOutcome::Failed;
                }
                Err(e) => {
                    warn!(error = %e, "failed to read token bucket");
                    return RefillOutcome::Failed;
                }
            };
            let tokens = match decode_u64(&bytes) {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "failed to decode token bucket");
                    return RefillOutcome::Failed;
                }
            };

            let refilled = tokens.saturating_add(tokens_per_refill).min(max_tokens);
            match self
                .store
                .set(TOKEN_BUCKET_KEY, &encode_u64(refilled), Some(cas))
            {
                Ok(()) => {
                    debug!(tokens = refilled, "token bucket refilled");
                    return RefillOutcome::Refilled { tokens: refilled };
                }
                Err(SharedDataError::CasMismatch) => continue,
                Err(e) => {
                    warn!(error = %e, "failed to refill token bucket");
                    return RefillOutcome::Failed;
                }
            }
        }

        warn!(
            retries = self.max_cas_retries,
            "token bucket contention during refill, window lost"
        );
        RefillOutcome::Failed
    }

    /// Tokens currently in the bucket (for tests and diagnostics)
    pub fn tokens(&self) -> Result<u64, SharedDataError> {
        match self.store.get(TOKEN_BUCKET_KEY)? {
            Some((bytes, _)) => decode_u64(&bytes),
            None => Err(SharedDataError::NotFound),
        }
    }
}

/// The request attributes a rate limit predicate can look at
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo<'a> {
    pub method: &'a str,
    pub host: &'a str,
    pub path: &'a str,
}

pub type RateLimitPredicate = Arc<dyn Fn(&RequestInfo<'_>) -> bool + Send + Sync>;

/// Rate limiter drawing from one shared token bucket
#[derive(Clone)]
pub struct RateLimiter {
    config: Config,
    bucket: TokenBucket,
    should_rate_limit: RateLimitPredicate,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a rate limiter; every request is subject to the limit.
    pub fn new(config: Config, store: Arc<dyn SharedData>) -> Self {
        let bucket = TokenBucket::new(store).with_max_cas_retries(config.max_cas_retries);
        Self {
            config,
            bucket,
            should_rate_limit: Arc::new(|_| true),
        }
    }

    /// Only requests for which `predicate` returns true consume tokens.
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RequestInfo<'_>) -> bool + Send + Sync + 'static,
    {
        self.should_rate_limit = Arc::new(predicate);
        self
    }

    /// Seed the shared bucket with one refill worth of tokens, capped at
    /// `max_tokens`.
    pub fn initialize(&self) -> Result<(), RateLimitError> {
        self.bucket
            .initialize(self.config.tokens_per_refill.min(self.config.max_tokens))
    }

    /// Check if a request should be allowed
    pub fn check(&self, request: &RequestInfo<'_>) -> RateLimitDecision {
        if !(self.should_rate_limit)(request) {
            return RateLimitDecision::Allow;
        }
        if self.bucket.try_acquire() {
            RateLimitDecision::Allow
        } else {
            debug!(method = %request.method, path = %request.path, "rate limited");
            RateLimitDecision::limit_exceeded(self.config.refill_interval())
        }
    }

    /// Periodic refill; call once per refill interval from every worker.
    pub fn on_tick(&self) -> RefillOutcome {
        self.bucket.refill(
            self.config.tokens_per_refill,
            self.config.refill_interval(),
            self.config.max_tokens,
        )
    }

    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    /// Get a reference to the config
    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::InMemorySharedData;
    use std::sync::atomic::{AtomicU64, Ordering};

    const SEC: u64 = 1_000_000_000;

    fn bucket() -> TokenBucket {
        TokenBucket::new(Arc::new(InMemorySharedData::new()))
    }

    /// Store whose writes always lose the race
    struct AlwaysContended(InMemorySharedData);

    impl SharedData for AlwaysContended {
        fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u32)>, SharedDataError> {
            self.0.get(key)
        }

        fn set(&self, key: &str, value: &[u8], cas: Option<u32>) -> Result<(), SharedDataError> {
            match cas {
                None => self.0.set(key, value, None),
                Some(_) => Err(SharedDataError::CasMismatch),
            }
        }
    }

    struct Unavailable;

    impl SharedData for Unavailable {
        fn get(&self, _key: &str) -> Result<Option<(Vec<u8>, u32)>, SharedDataError> {
            Err(SharedDataError::Unavailable("down".to_string()))
        }

        fn set(&self, _key: &str, _value: &[u8], _cas: Option<u32>) -> Result<(), SharedDataError> {
            Err(SharedDataError::Unavailable("down".to_string()))
        }
    }

    #[test]
    fn test_token_bucket_basic() {
        let bucket = bucket();
        bucket.initialize(3).unwrap();

        for i in 0..3 {
            assert!(bucket.try_acquire(), "Request {} should be allowed", i);
        }
        assert!(!bucket.try_acquire());
        assert_eq!(bucket.tokens().unwrap(), 0);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let bucket = bucket();
        bucket.initialize(2).unwrap();
        assert!(bucket.try_acquire());

        // a second worker must not reset the bucket
        bucket.initialize(2).unwrap();
        assert_eq!(bucket.tokens().unwrap(), 1);
    }

    #[test]
    fn test_uninitialized_bucket_denies() {
        assert!(!bucket().try_acquire());
        assert_eq!(
            bucket().refill_at(10 * SEC, 1, Duration::from_secs(1), 10),
            RefillOutcome::Failed
        );
    }

    #[test]
    fn test_refill_window() {
        let bucket = bucket();
        bucket.initialize(0).unwrap();
        let interval = Duration::from_secs(5);

        // last refill is 0, so the first refill at t=10s is due
        assert_eq!(
            bucket.refill_at(10 * SEC, 2, interval, 10),
            RefillOutcome::Refilled { tokens: 2 }
        );
        assert_eq!(bucket.refill_at(12 * SEC, 2, interval, 10), RefillOutcome::NotDue);
        assert_eq!(
            bucket.refill_at(15 * SEC, 2, interval, 10),
            RefillOutcome::Refilled { tokens: 4 }
        );
        assert_eq!(bucket.tokens().unwrap(), 4);
    }

    #[test]
    fn test_refill_never_exceeds_max() {
        let bucket = bucket();
        bucket.initialize(3).unwrap();
        let interval = Duration::from_secs(1);
        for t in 1..20 {
            bucket.refill_at(t * SEC, 3, interval, 5);
            assert!(bucket.tokens().unwrap() <= 5);
        }
        assert_eq!(bucket.tokens().unwrap(), 5);
    }

    #[test]
    fn test_refill_claimed_once_per_window() {
        let store: Arc<dyn SharedData> = Arc::new(InMemorySharedData::new());
        let a = TokenBucket::new(store.clone());
        let b = TokenBucket::new(store);
        a.initialize(0).unwrap();
        b.initialize(0).unwrap();

        let interval = Duration::from_secs(1);
        assert_eq!(
            a.refill_at(5 * SEC, 1, interval, 10),
            RefillOutcome::Refilled { tokens: 1 }
        );
        // same window, the second worker sees a fresh timestamp
        assert_eq!(b.refill_at(5 * SEC, 1, interval, 10), RefillOutcome::NotDue);
        assert_eq!(a.tokens().unwrap(), 1);
    }

    #[test]
    fn test_contention_is_bounded() {
        let store = AlwaysContended(InMemorySharedData::new());
        let bucket = TokenBucket::new(Arc::new(store)).with_max_cas_retries(3);
        bucket.initialize(5).unwrap();
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn test_store_errors_fail_closed() {
        let bucket = TokenBucket::new(Arc::new(Unavailable));
        assert!(bucket.initialize(1).is_err());
        assert!(!bucket.try_acquire());
        assert_eq!(
            bucket.refill_at(10 * SEC, 1, Duration::from_secs(1), 1),
            RefillOutcome::Failed
        );
    }

    #[test]
    fn test_no_lost_updates_under_contention() {
        let store: Arc<dyn SharedData> = Arc::new(InMemorySharedData::new());
        let bucket = TokenBucket::new(store).with_max_cas_retries(u32::MAX);
        bucket.initialize(1_000).unwrap();

        let granted = AtomicU64::new(0);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..200 {
                        if bucket.try_acquire() {
                            granted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        // 1600 attempts against 1000 tokens
        assert_eq!(granted.load(Ordering::Relaxed), 1_000);
        assert_eq!(bucket.tokens().unwrap(), 0);
    }

    #[test]
    fn test_concurrent_refill_and_acquire() {
        let store: Arc<dyn SharedData> = Arc::new(InMemorySharedData::new());
        let bucket = TokenBucket::new(store).with_max_cas_retries(u32::MAX);
        bucket.initialize(0).unwrap();
        let interval = Duration::from_secs(1);

        let granted = AtomicU64::new(0);
        std::thread::scope(|s| {
            s.spawn(|| {
                for t in 1..=50 {
                    bucket.refill_at(t * SEC, 10, interval, 25);
                }
            });
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..500 {
                        if bucket.try_acquire() {
                            granted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        let left = bucket.tokens().unwrap();
        assert!(left <= 25);
        // every token handed out was put in by a refill
        assert!(granted.load(Ordering::Relaxed) + left <= 500);
    }

    #[test]
    fn test_rate_limiter_predicate() {
        let config = Config::from_json(
            r#"{"max_tokens": 10, "tokens_per_refill": 1, "refill_interval_sec": 60}"#,
        )
        .unwrap();
        let limiter = RateLimiter::new(config, Arc::new(InMemorySharedData::new()))
            .with_predicate(|req| req.path.starts_with("/api"));
        limiter.initialize().unwrap();

        let api = RequestInfo {
            method: "GET",
            host: "example.com",
            path: "/api/items",
        };
        let health = RequestInfo {
            path: "/healthz",
            ..api
        };

        assert!(limiter.check(&api).is_allowed());
        assert!(!limiter.check(&api).is_allowed());
        // not subject to the limit
        assert!(limiter.check(&health).is_allowed());

        match limiter.check(&api) {
            RateLimitDecision::LimitExceeded { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(60));
            }
            _ => panic!("Expected LimitExceeded decision"),
        }
    }

    #[test]
    fn test_initial_tokens_capped_at_max() {
        let config = Config::from_json(
            r#"{"max_tokens": 2, "tokens_per_refill": 10, "refill_interval_sec": 1}"#,
        )
        .unwrap();
        let store: Arc<dyn SharedData> = Arc::new(InMemorySharedData::new());
        let limiter = RateLimiter::new(config, store.clone());
        limiter.initialize().unwrap();
        assert_eq!(TokenBucket::new(store).tokens().unwrap(), 2);

        let request = RequestInfo {
            method: "GET",
            host: "example.com",
            path: "/",
        };
        assert!(limiter.check(&request).is_allowed());
        assert!(limiter.check(&request).is_allowed());
        assert!(!limiter.check(&request).is_allowed());
    }
}
