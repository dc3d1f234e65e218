//! Persistence of per-key limiter state.
//!
//! Every update runs load -> compute -> compare-and-swap while holding a
//! process-local lock for the key. The lock serialises callers inside one
//! process; the swap rejects writes based on state another instance has
//! already replaced, in which case the step is recomputed.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::{
    error::{RateLimitError, RateLimitResult, StorageError},
    storage::Storage,
};

const MAX_SWAP_ATTEMPTS: usize = 32;

pub(crate) fn decode_state<S: DeserializeOwned>(raw: &[u8]) -> RateLimitResult<S> {
    Ok(serde_json::from_slice(raw)?)
}

pub(crate) fn encode_state<S: Serialize>(state: &S) -> RateLimitResult<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(state)?))
}

/// Storage handle plus the per-key locks of one limiter instance.
pub struct StateStore {
    storage: Arc<dyn Storage>,
    locks: KeyLocks,
}

impl StateStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            locks: KeyLocks::default(),
        }
    }

    async fn load_raw(&self, key: &str) -> RateLimitResult<Option<Bytes>> {
        match self.storage.get(key).await {
            Ok(raw) => Ok(Some(raw)),
            Err(StorageError::NotFound) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Decoded state for `key`, `None` if nothing live is stored.
    pub async fn load<S: DeserializeOwned>(&self, key: &str) -> RateLimitResult<Option<S>> {
        self.load_raw(key)
            .await?
            .map(|raw| decode_state(&raw))
            .transpose()
    }

    pub async fn save<S: Serialize>(&self, key: &str, state: &S, ttl: Duration) -> RateLimitResult<()> {
        self.storage.set(key, encode_state(state)?, ttl).await?;
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> RateLimitResult<()> {
        self.storage.delete(key).await?;
        Ok(())
    }

    /// Applies `step` to the current state of `key` and persists the result.
    ///
    /// `step` receives `None` when no state exists and may run more than once
    /// if a concurrent writer wins the swap.
    pub async fn update<S, T, F>(&self, key: &str, ttl: Duration, mut step: F) -> RateLimitResult<T>
    where
        S: Serialize + DeserializeOwned + Send,
        T: Send,
        F: FnMut(Option<S>) -> (S, T) + Send,
    {
        let _guard = self.locks.lock(key).await;

        for attempt in 1..=MAX_SWAP_ATTEMPTS {
            let current = self.load_raw(key).await?;
            let previous = current.as_deref().map(decode_state::<S>).transpose()?;
            let (next, outcome) = step(previous);
            let encoded = encode_state(&next)?;

            if self
                .storage
                .compare_and_swap(key, current.as_deref(), encoded, ttl)
                .await?
            {
                return Ok(outcome);
            }

            debug!(key = %key, attempt, "state changed concurrently; recomputing");
        }

        Err(RateLimitError::Contention {
            key: key.to_string(),
        })
    }

    #[cfg(test)]
    pub(crate) fn held_locks(&self) -> usize {
        self.locks.locks.len()
    }
}

#[derive(Default)]
struct KeyLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyLocks {
    async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let mutex = self.locks.entry(key.to_string()).or_default().clone();
        let guard = mutex.lock_owned().await;
        KeyGuard {
            locks: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }
}

struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left: nobody holds or awaits this key.
        self.locks
            .locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
