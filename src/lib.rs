//! Admission control for HTTP services: token bucket, leaky bucket and
//! sliding window limiters over pluggable storage, selected per request by an
//! ordered policy list.

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod middleware;
pub mod ratelimit;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::RequestContext;
pub use error::{ConfigError, RateLimitError, StorageError};
pub use ratelimit::{
    Algorithm, Limiter, ManagerDecision, Policy, PolicyManager, RateLimitDecision,
};
pub use storage::{InMemoryStorage, RedisStorage, Storage};
