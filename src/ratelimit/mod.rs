pub mod identity;
pub mod leaky_bucket;
pub mod manager;
pub mod routes;
pub mod sliding_window;
pub mod state;
pub mod token_bucket;

use std::{fmt, str::FromStr, time::Duration};

use async_trait::async_trait;

use crate::error::RateLimitResult;

pub use identity::IdentityExtractor;
pub use leaky_bucket::LeakyBucketLimiter;
pub use manager::{ManagerDecision, Policy, PolicyManager};
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::TokenBucketLimiter;

/// Default ttl for state records whose algorithm has no characteristic period.
pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    TokenBucket,
    LeakyBucket,
    SlidingWindow,
}

impl Algorithm {
    /// Namespace used for this algorithm's state keys.
    pub fn key_prefix(self) -> &'static str {
        match self {
            Self::TokenBucket => "tb",
            Self::LeakyBucket => "lb",
            Self::SlidingWindow => "sw",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TokenBucket => "token_bucket",
            Self::LeakyBucket => "leaky_bucket",
            Self::SlidingWindow => "sliding_window",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "token_bucket" => Ok(Self::TokenBucket),
            "leaky_bucket" => Ok(Self::LeakyBucket),
            "sliding_window" => Ok(Self::SlidingWindow),
            other => Err(other.to_string()),
        }
    }
}

/// Outcome of a single consumption attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub limit: u64,
    pub retry_after: Duration,
    pub reset_after: Duration,
}

impl RateLimitDecision {
    /// Decision returned for traffic no policy applies to.
    pub fn unmetered() -> Self {
        Self {
            allowed: true,
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait Limiter: Send + Sync {
    fn algorithm(&self) -> Algorithm;

    /// Evaluates one consumption attempt for `key` at the limiter's current time.
    async fn allow(&self, key: &str) -> RateLimitResult<RateLimitDecision>;
}

pub(crate) fn state_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}:{key}")
    }
}

/// Whole seconds, rounded up, as used for retry hints.
pub(crate) fn ceil_secs(secs: f64) -> Duration {
    if !secs.is_finite() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs(secs.ceil() as u64)
}
