use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    clock::{Clock, SystemClock},
    error::{ConfigError, RateLimitResult},
    ratelimit::{Algorithm, Limiter, RateLimitDecision, state::StateStore, state_key},
    storage::Storage,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlidingWindowState {
    pub prev_count: u64,
    pub curr_count: u64,
    pub curr_window_start: DateTime<Utc>,
}

/// Weighted two-window counter approximating a sliding window.
///
/// The previous window's count contributes linearly less as the current
/// window progresses, so only two counters are kept per key.
pub struct SlidingWindowLimiter {
    store: StateStore,
    limit: u64,
    window: Duration,
    window_delta: TimeDelta,
    ttl: Duration,
    key_prefix: String,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    pub fn new(
        storage: Arc<dyn Storage>,
        limit: u32,
        window: Duration,
        key_prefix: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let key_prefix = key_prefix.into();
        if limit == 0 {
            return Err(ConfigError::invalid(&key_prefix, "limit must be > 0"));
        }
        if window.is_zero() {
            return Err(ConfigError::invalid(&key_prefix, "window must be > 0"));
        }
        let window_delta = TimeDelta::from_std(window)
            .map_err(|_| ConfigError::invalid(&key_prefix, "window is too large"))?;
        let ttl = window
            .checked_mul(2)
            .ok_or_else(|| ConfigError::invalid(&key_prefix, "window is too large"))?;

        Ok(Self {
            store: StateStore::new(storage),
            limit: u64::from(limit),
            window,
            window_delta,
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

    pub async fn state(&self, key: &str) -> RateLimitResult<Option<SlidingWindowState>> {
        self.store.load(&self.state_key(key)).await
    }

    pub async fn reset(&self, key: &str) -> RateLimitResult<()> {
        self.store.remove(&self.state_key(key)).await
    }

    fn roll_window(&self, state: &mut SlidingWindowState, now: DateTime<Utc>) {
        let diff = now - state.curr_window_start;
        if diff < self.window_delta {
            return;
        }

        let windows_passed = match (diff.num_nanoseconds(), self.window_delta.num_nanoseconds()) {
            (Some(diff), Some(window)) => diff / window,
            _ => i64::MAX,
        };

        state.prev_count = if windows_passed == 1 { state.curr_count } else { 0 };
        state.curr_count = 0;

        let advanced = i32::try_from(windows_passed)
            .ok()
            .and_then(|n| self.window_delta.checked_mul(n))
            .and_then(|by| state.curr_window_start.checked_add_signed(by));

        state.curr_window_start = match advanced {
            Some(start) if start >= now - self.window_delta && start <= now => start,
            _ => now,
        };
    }

    fn step(
        &self,
        previous: Option<SlidingWindowState>,
        now: DateTime<Utc>,
    ) -> (SlidingWindowState, RateLimitDecision) {
        let mut state = previous.unwrap_or(SlidingWindowState {
            prev_count: 0,
            curr_count: 0,
            curr_window_start: now,
        });

        self.roll_window(&mut state, now);

        let into_window = (now - state.curr_window_start).to_std().unwrap_or_default();
        let window_secs = self.window.as_secs_f64();
        let weight = ((window_secs - into_window.as_secs_f64()) / window_secs).max(0.0);
        let estimated = (state.prev_count as f64 * weight).round() as u64 + state.curr_count;

        let mut decision = RateLimitDecision {
            limit: self.limit,
            remaining: self.limit.saturating_sub(estimated),
            ..RateLimitDecision::default()
        };

        if estimated < self.limit {
            state.curr_count += 1;
            decision.allowed = true;
            decision.remaining = self.limit.saturating_sub(estimated + 1);
        } else {
            decision.retry_after = self.window.checked_sub(into_window).unwrap_or(self.window);
            decision.reset_after = decision.retry_after;
        }

        (state, decision)
    }
}

#[async_trait]
impl Limiter for SlidingWindowLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindow
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
            "sliding window evaluated"
        );
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, storage::InMemoryStorage};

    fn limiter(limit: u32, window: Duration) -> (SlidingWindowLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let limiter = SlidingWindowLimiter::new(Arc::new(InMemoryStorage::new()), limit, window, "sw")
            .unwrap()
            .with_clock(clock.clone());
        (limiter, clock)
    }

    async fn admitted_until_denied(limiter: &SlidingWindowLimiter, key: &str) -> usize {
        let mut admitted = 0;
        while limiter.allow(key).await.unwrap().allowed {
            admitted += 1;
        }
        admitted
    }

    #[tokio::test]
    async fn test_resets_after_multiple_windows() {
        let (limiter, clock) = limiter(2, Duration::from_millis(100));

        assert!(limiter.allow("user").await.unwrap().allowed);
        assert!(limiter.allow("user").await.unwrap().allowed);
        assert!(!limiter.allow("user").await.unwrap().allowed);

        clock.advance(Duration::from_millis(250));
        assert!(limiter.allow("user").await.unwrap().allowed);
        assert!(limiter.allow("user").await.unwrap().allowed);

        let state = limiter.state("user").await.unwrap().unwrap();
        assert_eq!(state.prev_count, 0);
        assert_eq!(state.curr_count, 2);
    }

    #[tokio::test]
    async fn test_previous_window_decays_linearly() {
        let (limiter, clock) = limiter(10, Duration::from_millis(1000));

        assert_eq!(admitted_until_denied(&limiter, "k").await, 10);

        // one full window plus 46% of the next: 10 * 0.54 rounds to 5 carried over
        clock.advance(Duration::from_millis(1460));
        assert_eq!(admitted_until_denied(&limiter, "k").await, 5);
    }

    #[tokio::test]
    async fn test_single_window_rollover_carries_count() {
        let (limiter, clock) = limiter(4, Duration::from_secs(10));
        for _ in 0..4 {
            limiter.allow("k").await.unwrap();
        }

        clock.advance(Duration::from_secs(10));
        // weight 1.0 right at the boundary: the old window still counts fully
        let denied = limiter.allow("k").await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::from_secs(10));

        let state = limiter.state("k").await.unwrap().unwrap();
        assert_eq!(state.prev_count, 4);
        assert_eq!(state.curr_count, 0);
    }

    #[tokio::test]
    async fn test_denial_reports_time_left_in_window() {
        let (limiter, clock) = limiter(1, Duration::from_secs(10));
        limiter.allow("k").await.unwrap();

        clock.advance(Duration::from_secs(4));
        let denied = limiter.allow("k").await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after, Duration::from_secs(6));
        assert_eq!(denied.reset_after, Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_remaining_counts_down() {
        let (limiter, _clock) = limiter(3, Duration::from_secs(1));
        let remaining: Vec<u64> = {
            let mut out = Vec::new();
            for _ in 0..3 {
                out.push(limiter.allow("k").await.unwrap().remaining);
            }
            out
        };
        assert_eq!(remaining, vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn test_window_start_is_clamped_on_clock_jump() {
        let (limiter, clock) = limiter(5, Duration::from_secs(1));
        limiter.allow("k").await.unwrap();

        clock.advance(Duration::from_secs(86_400 * 365));
        let now = clock.now();
        assert!(limiter.allow("k").await.unwrap().allowed);

        let state = limiter.state("k").await.unwrap().unwrap();
        assert!(state.curr_window_start <= now);
        assert!(state.curr_window_start >= now - TimeDelta::seconds(1));
        assert_eq!(state.prev_count, 0);
    }

    #[tokio::test]
    async fn test_clock_moving_backwards_does_not_overcount() {
        let (limiter, clock) = limiter(2, Duration::from_secs(1));
        let start = clock.now();
        limiter.allow("k").await.unwrap();

        clock.set(start - TimeDelta::milliseconds(500));
        let decision = limiter.allow("k").await.unwrap();
        assert!(decision.allowed);
        assert!(!limiter.allow("k").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_missing_state_equals_zero_counts() {
        let (fresh, clock) = limiter(3, Duration::from_secs(1));
        let seeded = SlidingWindowLimiter::new(Arc::new(InMemoryStorage::new()), 3, Duration::from_secs(1), "sw")
            .unwrap()
            .with_clock(clock.clone());
        seeded
            .store
            .save(
                &seeded.state_key("k"),
                &SlidingWindowState {
                    prev_count: 0,
                    curr_count: 0,
                    curr_window_start: clock.now(),
                },
                Duration::from_secs(2),
            )
            .await
            .unwrap();

        for _ in 0..4 {
            assert_eq!(fresh.allow("k").await.unwrap(), seeded.allow("k").await.unwrap());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_admits_never_exceed_limit() {
        let (limiter, _clock) = limiter(7, Duration::from_secs(1));
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.allow("shared").await.unwrap().allowed })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 7);
    }

    #[test]
    fn test_rejects_invalid_parameters() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        assert!(SlidingWindowLimiter::new(storage.clone(), 0, Duration::from_secs(1), "sw").is_err());
        assert!(SlidingWindowLimiter::new(storage.clone(), 1, Duration::ZERO, "sw").is_err());
        assert!(matches!(
            SlidingWindowLimiter::new(storage, 1, Duration::from_secs(u64::MAX), "sw").err(),
            Some(ConfigError::InvalidParameter { .. })
        ));
    }
}
