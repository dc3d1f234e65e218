use std::{future::Future, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use redis::{AsyncCommands, Script, aio::ConnectionManager};

use crate::{
    error::{StorageError, StorageResult},
    storage::{Storage, ensure_ttl},
};

// ARGV[1] = 1 when a current value is expected, ARGV[2] = expected value,
// ARGV[3] = new value, ARGV[4] = ttl in milliseconds.
const COMPARE_AND_SWAP_LUA: &str = r#"
local key = KEYS[1]
local has_expected = ARGV[1] == '1'
local current = redis.call('GET', key)

if has_expected then
  if current == false or current ~= ARGV[2] then
    return 0
  end
elseif current ~= false then
  return 0
end

redis.call('SET', key, ARGV[3], 'PX', tonumber(ARGV[4]))
return 1
"#;

/// Storage shared between instances through Redis. Expiry is native (`PX`).
pub struct RedisStorage {
    manager: ConnectionManager,
    key_prefix: String,
    op_timeout: Duration,
    cas_script: Script,
}

impl RedisStorage {
    pub async fn new(url: String, key_prefix: String, op_timeout: Duration) -> StorageResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = bounded(op_timeout, client.get_connection_manager()).await?;
        Ok(Self {
            manager,
            key_prefix,
            op_timeout,
            cas_script: Script::new(COMPARE_AND_SWAP_LUA),
        })
    }

    fn key(&self, key: &str) -> String {
        namespaced(&self.key_prefix, key)
    }
}

fn namespaced(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}:{key}")
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

async fn bounded<T, F>(limit: Duration, fut: F) -> StorageResult<T>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(StorageError::from),
        Err(_) => Err(StorageError::Timeout(limit)),
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let mut conn = self.manager.clone();
        let value: Option<Vec<u8>> = bounded(self.op_timeout, conn.get(self.key(key))).await?;
        value.map(Bytes::from).ok_or(StorageError::NotFound)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> StorageResult<()> {
        let ttl = ensure_ttl(ttl)?;
        let mut conn = self.manager.clone();
        bounded(
            self.op_timeout,
            conn.pset_ex::<_, _, ()>(self.key(key), value.as_ref(), ttl_millis(ttl)),
        )
        .await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let mut conn = self.manager.clone();
        bounded(self.op_timeout, conn.del::<_, ()>(self.key(key))).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Bytes,
        ttl: Duration,
    ) -> StorageResult<bool> {
        let ttl = ensure_ttl(ttl)?;
        let mut conn = self.manager.clone();
        let mut invocation = self.cas_script.key(self.key(key));
        invocation
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or_default())
            .arg(new.as_ref())
            .arg(ttl_millis(ttl));

        let swapped: i64 = bounded(self.op_timeout, invocation.invoke_async(&mut conn)).await?;
        Ok(swapped == 1)
    }
}
