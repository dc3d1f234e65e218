use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry};
use tokio::time::Instant;

use crate::{
    error::{StorageError, StorageResult},
    storage::{Storage, ensure_ttl},
};

struct StoredValue {
    value: Bytes,
    expires_at: Instant,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

fn expiry(now: Instant, ttl: Duration) -> StorageResult<Instant> {
    now.checked_add(ttl).ok_or(StorageError::InvalidTtl)
}

/// Process-local storage. Expired entries are dropped the next time they are read.
#[derive(Default)]
pub struct InMemoryStorage {
    entries: DashMap<String, StoredValue>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Entries currently held, including expired ones not yet collected.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, stored| stored.is_live(now));
        before.saturating_sub(self.entries.len())
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let now = Instant::now();
        if let Some(stored) = self.entries.get(key) {
            if stored.is_live(now) {
                return Ok(stored.value.clone());
            }
        } else {
            return Err(StorageError::NotFound);
        }

        self.entries.remove_if(key, |_, stored| !stored.is_live(now));
        Err(StorageError::NotFound)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> StorageResult<()> {
        let ttl = ensure_ttl(ttl)?;
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at: expiry(Instant::now(), ttl)?,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Bytes,
        ttl: Duration,
    ) -> StorageResult<bool> {
        let ttl = ensure_ttl(ttl)?;
        let now = Instant::now();
        let replacement = StoredValue {
            value: new,
            expires_at: expiry(now, ttl)?,
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let live = occupied.get().is_live(now).then(|| occupied.get().value.as_ref());
                if live != expected {
                    return Ok(false);
                }
                occupied.insert(replacement);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                vacant.insert(replacement);
                Ok(true)
            }
        }
    }
}
