// Shared key-value store backing presence leases, connect locks, and push
// suppression windows.
//
// Production runs against Redis; the `Memory` variant implements the same
// TTL semantics in-process so the whole ownership protocol is testable
// without a server. The memory clock is `tokio::time::Instant`, so tests
// can pause and advance time to force lease expiry.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use redis::AsyncCommands;
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("redis command failed: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type KvResult<T> = Result<T, KvError>;

/// Compare-and-delete: deletes the key only when it still holds the
/// caller's value. Runs as a single atomic script to close the
/// check-then-delete race.
const COMPARE_AND_DELETE: &str =
    "if redis.call('get', KEYS[1]) == ARGV[1] then return redis.call('del', KEYS[1]) else return 0 end";

#[derive(Clone)]
pub enum KvStore {
    Redis(redis::aio::ConnectionManager),
    Memory(MemoryKv),
}

impl KvStore {
    pub async fn connect_redis(url: &str) -> KvResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self::Redis(manager))
    }

    pub fn memory() -> Self {
        Self::Memory(MemoryKv::default())
    }

    pub async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()> {
        match self {
            Self::Redis(manager) => {
                let mut conn = manager.clone();
                conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await?;
                Ok(())
            }
            Self::Memory(kv) => {
                kv.lock().strings.insert(
                    key.to_string(),
                    StringEntry { value: value.to_string(), expires_at: Some(Instant::now() + ttl) },
                );
                Ok(())
            }
        }
    }

    /// SET NX EX: returns true when the key was created by this call.
    pub async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> KvResult<bool> {
        match self {
            Self::Redis(manager) => {
                let mut conn = manager.clone();
                let created: Option<String> = redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl.as_secs())
                    .query_async(&mut conn)
                    .await?;
                Ok(created.is_some())
            }
            Self::Memory(kv) => {
                let mut inner = kv.lock();
                if inner.live_string(key).is_some() {
                    return Ok(false);
                }
                inner.strings.insert(
                    key.to_string(),
                    StringEntry { value: value.to_string(), expires_at: Some(Instant::now() + ttl) },
                );
                Ok(true)
            }
        }
    }

    pub async fn get(&self, key: &str) -> KvResult<Option<String>> {
        match self {
            Self::Redis(manager) => {
                let mut conn = manager.clone();
                Ok(conn.get(key).await?)
            }
            Self::Memory(kv) => Ok(kv.lock().live_string(key).map(|entry| entry.value.clone())),
        }
    }

    pub async fn exists(&self, key: &str) -> KvResult<bool> {
        match self {
            Self::Redis(manager) => {
                let mut conn = manager.clone();
                Ok(conn.exists(key).await?)
            }
            Self::Memory(kv) => Ok(kv.lock().live_string(key).is_some()),
        }
    }

    pub async fn delete(&self, key: &str) -> KvResult<()> {
        match self {
            Self::Redis(manager) => {
                let mut conn = manager.clone();
                conn.del::<_, ()>(key).await?;
                Ok(())
            }
            Self::Memory(kv) => {
                kv.lock().strings.remove(key);
                Ok(())
            }
        }
    }

    /// Atomic compare-and-delete; true when the key held `expected` and was
    /// removed by this call.
    pub async fn delete_if_equals(&self, key: &str, expected: &str) -> KvResult<bool> {
        match self {
            Self::Redis(manager) => {
                let mut conn = manager.clone();
                let deleted: i64 = redis::Script::new(COMPARE_AND_DELETE)
                    .key(key)
                    .arg(expected)
                    .invoke_async(&mut conn)
                    .await?;
                Ok(deleted == 1)
            }
            Self::Memory(kv) => {
                let mut inner = kv.lock();
                let matches = inner
                    .live_string(key)
                    .is_some_and(|entry| entry.value == expected);
                if matches {
                    inner.strings.remove(key);
                }
                Ok(matches)
            }
        }
    }

    /// Refresh a key's TTL; false when the key does not exist (the caller
    /// uses this to detect a silently expired lease).
    pub async fn refresh_ttl(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        match self {
            Self::Redis(manager) => {
                let mut conn = manager.clone();
                Ok(conn.expire(key, ttl.as_secs() as i64).await?)
            }
            Self::Memory(kv) => {
                let mut inner = kv.lock();
                match inner.live_string_mut(key) {
                    Some(entry) => {
                        entry.expires_at = Some(Instant::now() + ttl);
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
        }
    }

    /// Remaining TTL in seconds; `None` when the key is absent or has no
    /// expiry.
    pub async fn remaining_ttl(&self, key: &str) -> KvResult<Option<u64>> {
        match self {
            Self::Redis(manager) => {
                let mut conn = manager.clone();
                let ttl: i64 = conn.ttl(key).await?;
                Ok(if ttl > 0 { Some(ttl as u64) } else { None })
            }
            Self::Memory(kv) => {
                let mut inner = kv.lock();
                Ok(inner.live_string(key).and_then(|entry| {
                    entry
                        .expires_at
                        .map(|at| at.saturating_duration_since(Instant::now()).as_secs())
                }))
            }
        }
    }

    pub async fn set_add(&self, set: &str, member: &str) -> KvResult<()> {
        match self {
            Self::Redis(manager) => {
                let mut conn = manager.clone();
                conn.sadd::<_, _, ()>(set, member).await?;
                Ok(())
            }
            Self::Memory(kv) => {
                kv.lock()
                    .sets
                    .entry(set.to_string())
                    .or_default()
                    .insert(member.to_string());
                Ok(())
            }
        }
    }

    pub async fn set_remove(&self, set: &str, member: &str) -> KvResult<()> {
        match self {
            Self::Redis(manager) => {
                let mut conn = manager.clone();
                conn.srem::<_, _, ()>(set, member).await?;
                Ok(())
            }
            Self::Memory(kv) => {
                if let Some(members) = kv.lock().sets.get_mut(set) {
                    members.remove(member);
                }
                Ok(())
            }
        }
    }

    pub async fn set_contains(&self, set: &str, member: &str) -> KvResult<bool> {
        match self {
            Self::Redis(manager) => {
                let mut conn = manager.clone();
                Ok(conn.sismember(set, member).await?)
            }
            Self::Memory(kv) => Ok(kv
                .lock()
                .sets
                .get(set)
                .is_some_and(|members| members.contains(member))),
        }
    }

    pub async fn set_members(&self, set: &str) -> KvResult<Vec<String>> {
        match self {
            Self::Redis(manager) => {
                let mut conn = manager.clone();
                Ok(conn.smembers(set).await?)
            }
            Self::Memory(kv) => Ok(kv
                .lock()
                .sets
                .get(set)
                .map(|members| members.iter().cloned().collect())
                .unwrap_or_default()),
        }
    }

    pub async fn set_len(&self, set: &str) -> KvResult<usize> {
        match self {
            Self::Redis(manager) => {
                let mut conn = manager.clone();
                Ok(conn.scard(set).await?)
            }
            Self::Memory(kv) => Ok(kv.lock().sets.get(set).map(HashSet::len).unwrap_or(0)),
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryKv {
    inner: Arc<Mutex<MemoryKvInner>>,
}

impl MemoryKv {
    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryKvInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Default)]
struct MemoryKvInner {
    strings: HashMap<String, StringEntry>,
    sets: HashMap<String, HashSet<String>>,
}

struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl StringEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

impl MemoryKvInner {
    /// Lazily drops an expired entry on access, mirroring Redis expiry.
    fn live_string(&mut self, key: &str) -> Option<&StringEntry> {
        if self.strings.get(key).is_some_and(StringEntry::is_expired) {
            self.strings.remove(key);
        }
        self.strings.get(key)
    }

    fn live_string_mut(&mut self, key: &str) -> Option<&mut StringEntry> {
        if self.strings.get(key).is_some_and(StringEntry::is_expired) {
            self.strings.remove(key);
        }
        self.strings.get_mut(key)
    }
}
