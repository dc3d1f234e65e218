use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    clock::{Clock, SystemClock},
    error::{ConfigError, RateLimitResult},
    ratelimit::{Algorithm, Limiter, RateLimitDecision, ceil_secs, state::StateStore, state_key},
    storage::Storage,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketState {
    pub tokens: f64,
    pub last_refill: DateTime<Utc>,
}

/// Fixed-capacity bucket refilled by `refill_rate` tokens every `refill_interval`.
pub struct TokenBucketLimiter {
    store: StateStore,
    capacity: f64,
    refill_rate: f64,
    refill_interval: Duration,
    ttl: Duration,
    key_prefix: String,
    clock: Arc<dyn Clock>,
}

impl TokenBucketLimiter {
    pub fn new(
        storage: Arc<dyn Storage>,
        capacity: u32,
        refill_rate: u32,
        refill_interval: Duration,
        key_prefix: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let key_prefix = key_prefix.into();
        if capacity == 0 {
            return Err(ConfigError::invalid(&key_prefix, "capacity must be > 0"));
        }
        if refill_rate == 0 {
            return Err(ConfigError::invalid(&key_prefix, "refill_rate must be > 0"));
        }
        if refill_interval.is_zero() {
            return Err(ConfigError::invalid(&key_prefix, "interval must be > 0"));
        }
        let ttl = refill_interval
            .checked_mul(2)
            .ok_or_else(|| ConfigError::invalid(&key_prefix, "interval is too large"))?;

        Ok(Self {
            store: StateStore::new(storage),
            capacity: f64::from(capacity),
            refill_rate: f64::from(refill_rate),
            refill_interval,
            ttl,
            key_prefix,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        if !ttl.is_zero() {
            self.ttl = ttl;
        }
        self
    }

    pub fn state_key(&self, key: &str) -> String {
        state_key(&self.key_prefix, key)
    }

    /// Stored state for `key`, if any.
    pub async fn state(&self, key: &str) -> RateLimitResult<Option<TokenBucketState>> {
        self.store.load(&self.state_key(key)).await
    }

    pub async fn reset(&self, key: &str) -> RateLimitResult<()> {
        self.store.remove(&self.state_key(key)).await
    }

    fn step(
        &self,
        previous: Option<TokenBucketState>,
        now: DateTime<Utc>,
    ) -> (TokenBucketState, RateLimitDecision) {
        let mut state = previous.unwrap_or(TokenBucketState {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = (now - state.last_refill).to_std().unwrap_or_default();
        if !elapsed.is_zero() {
            let refills = elapsed.as_secs_f64() / self.refill_interval.as_secs_f64();
            state.tokens = self.capacity.min(state.tokens + refills * self.refill_rate);
            state.last_refill = now;
        }

        let mut decision = RateLimitDecision {
            limit: self.capacity as u64,
            ..RateLimitDecision::default()
        };

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            decision.allowed = true;
        } else {
            let needed = 1.0 - state.tokens;
            let secs_per_token = self.refill_interval.as_secs_f64() / self.refill_rate;
            decision.retry_after = ceil_secs(needed * secs_per_token).min(self.refill_interval);
            decision.reset_after = decision.retry_after;
        }

        decision.remaining = state.tokens.max(0.0).floor() as u64;
        (state, decision)
    }
}

#[async_trait]
impl Limiter for TokenBucketLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }

    async fn allow(&self, key: &str) -> RateLimitResult<RateLimitDecision> {
        let state_key = self.state_key(key);
        let decision = self
            .store
            .update(&state_key, self.ttl, |previous| self.step(previous, self.clock.now()))
            .await?;

        trace!(
            key = %state_key,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "token bucket evaluated"
        );
        Ok(decision)
    }
}
