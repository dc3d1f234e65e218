//! Key-value capability used to persist per-identity limiter state.
//!
//! Both backends honour the same contract: a value read after its ttl has
//! elapsed is indistinguishable from one that was never written.

pub mod in_memory;
pub mod redis_backend;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{StorageError, StorageResult};

pub use in_memory::InMemoryStorage;
pub use redis_backend::RedisStorage;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Returns `StorageError::NotFound` for missing or expired keys.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> StorageResult<()>;

    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Writes `new` only if the live value for `key` equals `expected`
    /// (`None` meaning absent or expired). Returns whether the write happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Bytes,
        ttl: Duration,
    ) -> StorageResult<bool>;
}

/// Longest expiry either backend stores; larger ttls are clamped to it.
pub const MAX_TTL: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// Rejects a zero ttl and clamps the rest to [`MAX_TTL`].
pub(crate) fn ensure_ttl(ttl: Duration) -> StorageResult<Duration> {
    if ttl.is_zero() {
        return Err(StorageError::InvalidTtl);
    }
    Ok(ttl.min(MAX_TTL))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_ttl() {
        assert!(matches!(ensure_ttl(Duration::ZERO), Err(StorageError::InvalidTtl)));
        assert_eq!(ensure_ttl(Duration::from_secs(5)).unwrap(), Duration::from_secs(5));
        assert_eq!(ensure_ttl(Duration::MAX).unwrap(), MAX_TTL);
    }
}
