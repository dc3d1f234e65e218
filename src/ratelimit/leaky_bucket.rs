use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    clock::{Clock, SystemClock},
    error::{ConfigError, RateLimitResult},
    ratelimit::{
        Algorithm, DEFAULT_STATE_TTL, Limiter, RateLimitDecision, ceil_secs, state::StateStore,
        state_key,
    },
    storage::Storage,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeakyBucketState {
    pub water_level: f64,
    pub last_leak: DateTime<Utc>,
}

/// Each admitted request adds one unit of water; the bucket drains at
/// `leak_rate` units per second and rejects once it would overflow.
pub struct LeakyBucketLimiter {
    store: StateStore,
    capacity: f64,
    leak_rate: f64,
    ttl: Duration,
    key_prefix: String,
    clock: Arc<dyn Clock>,
}

impl LeakyBucketLimiter {
    pub fn new(
        storage: Arc<dyn Storage>,
        capacity: u32,
        leak_rate: f64,
        key_prefix: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let key_prefix = key_prefix.into();
        if capacity == 0 {
            return Err(ConfigError::invalid(&key_prefix, "limit must be > 0"));
        }
        if !(leak_rate.is_finite() && leak_rate > 0.0) {
            return Err(ConfigError::invalid(&key_prefix, "leak_rate must be > 0"));
        }

        Ok(Self {
            store: StateStore::new(storage),
            capacity: f64::from(capacity),
            leak_rate,
            ttl: DEFAULT_STATE_TTL,
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

    pub async fn state(&self, key: &str) -> RateLimitResult<Option<LeakyBucketState>> {
        self.store.load(&self.state_key(key)).await
    }

    pub async fn reset(&self, key: &str) -> RateLimitResult<()> {
        self.store.remove(&self.state_key(key)).await
    }

    fn step(
        &self,
        previous: Option<LeakyBucketState>,
        now: DateTime<Utc>,
    ) -> (LeakyBucketState, RateLimitDecision) {
        let mut state = previous.unwrap_or(LeakyBucketState {
            water_level: 0.0,
            last_leak: now,
        });

        let elapsed = (now - state.last_leak).to_std().unwrap_or_default();
        if !elapsed.is_zero() {
            let leaked = elapsed.as_secs_f64() * self.leak_rate;
            state.water_level = (state.water_level - leaked).max(0.0);
            state.last_leak = now;
        }

        let mut decision = RateLimitDecision {
            limit: self.capacity as u64,
            ..RateLimitDecision::default()
        };

        if state.water_level + 1.0 <= self.capacity {
            state.water_level += 1.0;
            decision.allowed = true;
        } else {
            decision.retry_after = ceil_secs((state.water_level + 1.0 - self.capacity) / self.leak_rate);
            decision.reset_after = decision.retry_after;
        }

        decision.remaining = (self.capacity - state.water_level).max(0.0).floor() as u64;
        (state, decision)
    }
}

#[async_trait]
impl Limiter for LeakyBucketLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::LeakyBucket
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
            "leaky bucket evaluated"
        );
        Ok(decision)
    }
}
