//! Membership store port: the operations repositories need from the external store.
//!
//! Implementations: in-memory (tests, single-process runs) and Redis. The Bloom and Cuckoo
//! operations need the RedisBloom module (Redis Stack, or Redis 8+).
//!
//! None of these operations are combined atomically: a check followed by an insert can
//! race with another client doing the same.

use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Exact keys with a time to live.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn exists(&self, key: &[u8]) -> Result<bool, StoreError>;

    /// Write `value` under `key`, expiring after `ttl`. Overwrites.
    async fn set_with_expiry(&self, key: &[u8], value: &[u8], ttl: Duration)
    -> Result<(), StoreError>;

    /// Write only when `key` is absent, in one round trip. Returns true when written.
    async fn set_if_absent(&self, key: &[u8], value: &[u8], ttl: Duration)
    -> Result<bool, StoreError>;

    /// Number of live keys in the store.
    async fn key_count(&self) -> Result<u64, StoreError>;

    /// Remaining time to live. None when the key is missing or never expires.
    async fn time_to_live(&self, key: &[u8]) -> Result<Option<Duration>, StoreError>;
}

/// Scalable Bloom filter operations.
#[async_trait]
pub trait BloomStore: Send + Sync {
    async fn bf_reserve(
        &self,
        filter: &str,
        error_rate: f64,
        capacity: u64,
        expansion: u32,
    ) -> Result<(), StoreError>;

    /// Returns true when the item was newly added.
    async fn bf_add(&self, filter: &str, item: &[u8]) -> Result<bool, StoreError>;

    async fn bf_exists(&self, filter: &str, item: &[u8]) -> Result<bool, StoreError>;
}

/// Cuckoo filter operations.
#[async_trait]
pub trait CuckooStore: Send + Sync {
    async fn cf_reserve(&self, filter: &str, capacity: u64, bucket_size: u32)
    -> Result<(), StoreError>;

    async fn cf_add(&self, filter: &str, item: &[u8]) -> Result<bool, StoreError>;

    async fn cf_exists(&self, filter: &str, item: &[u8]) -> Result<bool, StoreError>;

    /// Removes one occurrence of the item. Returns false when it was not present.
    async fn cf_del(&self, filter: &str, item: &[u8]) -> Result<bool, StoreError>;
}

/// Expired keys are swept on write once the map reaches this size (doubling after each
/// sweep) or when this long has passed since the last sweep.
const SWEEP_MIN_KEYS: usize = 1024;
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Default)]
struct MemoryInner {
    keys: HashMap<Vec<u8>, (Vec<u8>, Instant)>,
    blooms: HashMap<String, std::collections::HashSet<Vec<u8>>>,
    cuckoos: HashMap<String, HashMap<Vec<u8>, u32>>,
    sweep_at_len: usize,
    next_sweep: Option<Instant>,
}

/// Expiry instant for a TTL, saturating for TTLs past what `Instant` can represent.
fn expiry(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}

impl MemoryInner {
    fn insert_key(&mut self, key: &[u8], value: &[u8], expires_at: Instant, now: Instant) {
        let due = self.next_sweep.is_none_or(|at| now >= at);
        if due || self.keys.len() >= self.sweep_at_len.max(SWEEP_MIN_KEYS) {
            self.keys.retain(|_, (_, exp)| *exp > now);
            self.sweep_at_len = self.keys.len().saturating_mul(2);
            self.next_sweep = Some(now + SWEEP_INTERVAL);
        }
        self.keys.insert(key.to_vec(), (value.to_vec(), expires_at));
    }

    fn live(&mut self, key: &[u8], now: Instant) -> bool {
        match self.keys.get(key) {
            Some((_, expires_at)) if *expires_at > now => true,
            Some(_) => {
                self.keys.remove(key);
                false
            }
            None => false,
        }
    }
}

/// In-memory store. Filters are exact sets, so they never report false positives.
/// Expiry follows tokio time, which tests can pause and advance.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
    ops: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total operations served since creation.
    pub fn ops(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }

    fn count(&self) {
        self.ops.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn exists(&self, key: &[u8]) -> Result<bool, StoreError> {
        self.count();
        let mut g = self.inner.write().await;
        Ok(g.live(key, Instant::now()))
    }

    async fn set_with_expiry(
        &self,
        key: &[u8],
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.count();
        let mut g = self.inner.write().await;
        let now = Instant::now();
        g.insert_key(key, value, expiry(now, ttl), now);
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &[u8],
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.count();
        let mut g = self.inner.write().await;
        let now = Instant::now();
        if g.live(key, now) {
            return Ok(false);
        }
        g.insert_key(key, value, expiry(now, ttl), now);
        Ok(true)
    }

    async fn key_count(&self) -> Result<u64, StoreError> {
        self.count();
        let g = self.inner.read().await;
        let now = Instant::now();
        let keys = g.keys.values().filter(|(_, exp)| *exp > now).count();
        Ok((keys + g.blooms.len() + g.cuckoos.len()) as u64)
    }

    async fn time_to_live(&self, key: &[u8]) -> Result<Option<Duration>, StoreError> {
        self.count();
        let g = self.inner.read().await;
        let now = Instant::now();
        Ok(g.keys
            .get(key)
            .filter(|(_, exp)| *exp > now)
            .map(|(_, exp)| *exp - now))
    }
}

#[async_trait]
impl BloomStore for MemoryStore {
    async fn bf_reserve(
        &self,
        filter: &str,
        _error_rate: f64,
        _capacity: u64,
        _expansion: u32,
    ) -> Result<(), StoreError> {
        self.count();
        let mut g = self.inner.write().await;
        if g.blooms.contains_key(filter) {
            return Err(StoreError::FilterExists(filter.to_string()));
        }
        g.blooms.insert(filter.to_string(), Default::default());
        Ok(())
    }

    async fn bf_add(&self, filter: &str, item: &[u8]) -> Result<bool, StoreError> {
        self.count();
        let mut g = self.inner.write().await;
        Ok(g.blooms
            .entry(filter.to_string())
            .or_default()
            .insert(item.to_vec()))
    }

    async fn bf_exists(&self, filter: &str, item: &[u8]) -> Result<bool, StoreError> {
        self.count();
        let g = self.inner.read().await;
        Ok(g.blooms.get(filter).is_some_and(|s| s.contains(item)))
    }
}

#[async_trait]
impl CuckooStore for MemoryStore {
    async fn cf_reserve(
        &self,
        filter: &str,
        _capacity: u64,
        _bucket_size: u32,
    ) -> Result<(), StoreError> {
        self.count();
        let mut g = self.inner.write().await;
        if g.cuckoos.contains_key(filter) {
            return Err(StoreError::FilterExists(filter.to_string()));
        }
        g.cuckoos.insert(filter.to_string(), HashMap::new());
        Ok(())
    }

    async fn cf_add(&self, filter: &str, item: &[u8]) -> Result<bool, StoreError> {
        self.count();
        let mut g = self.inner.write().await;
        *g.cuckoos
            .entry(filter.to_string())
            .or_default()
            .entry(item.to_vec())
            .or_insert(0) += 1;
        Ok(true)
    }

    async fn cf_exists(&self, filter: &str, item: &[u8]) -> Result<bool, StoreError> {
        self.count();
        let g = self.inner.read().await;
        Ok(g.cuckoos.get(filter).is_some_and(|m| m.contains_key(item)))
    }

    async fn cf_del(&self, filter: &str, item: &[u8]) -> Result<bool, StoreError> {
        self.count();
        let mut g = self.inner.write().await;
        let Some(items) = g.cuckoos.get_mut(filter) else {
            return Ok(false);
        };
        match items.get_mut(item) {
            Some(n) if *n > 1 => {
                *n -= 1;
                Ok(true)
            }
            Some(_) => {
                items.remove(item);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Redis-backed store. The connection manager reconnects on its own and is cloned per
/// call, so concurrent callers pipeline over one connection without a client-side lock.
#[derive(Clone)]
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis at url (e.g. `redis://127.0.0.1/`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    fn conn(&self) -> redis::aio::ConnectionManager {
        self.conn.clone()
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// RedisBloom answers `ERR item exists` when reserving over an existing filter.
fn reserve_error(filter: &str, e: redis::RedisError) -> StoreError {
    if e.to_string().contains("item exists") {
        StoreError::FilterExists(filter.to_string())
    } else {
        StoreError::Redis(e)
    }
}

#[async_trait]
impl KeyStore for RedisStore {
    async fn exists(&self, key: &[u8]) -> Result<bool, StoreError> {
        use redis::AsyncCommands;
        let mut conn = self.conn();
        let found: bool = conn.exists(key).await?;
        Ok(found)
    }

    async fn set_with_expiry(
        &self,
        key: &[u8],
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &[u8],
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn key_count(&self) -> Result<u64, StoreError> {
        let mut conn = self.conn();
        let n: u64 = redis::cmd("DBSIZE").query_async(&mut conn).await?;
        Ok(n)
    }

    async fn time_to_live(&self, key: &[u8]) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.conn();
        let ms: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        // -2: missing, -1: no expiry
        Ok((ms >= 0).then(|| Duration::from_millis(ms as u64)))
    }
}

#[async_trait]
impl BloomStore for RedisStore {
    async fn bf_reserve(
        &self,
        filter: &str,
        error_rate: f64,
        capacity: u64,
        expansion: u32,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: () = redis::cmd("BF.RESERVE")
            .arg(filter)
            .arg(error_rate)
            .arg(capacity)
            .arg("EXPANSION")
            .arg(expansion)
            .query_async(&mut conn)
            .await
            .map_err(|e| reserve_error(filter, e))?;
        Ok(())
    }

    async fn bf_add(&self, filter: &str, item: &[u8]) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let added: bool = redis::cmd("BF.ADD")
            .arg(filter)
            .arg(item)
            .query_async(&mut conn)
            .await?;
        Ok(added)
    }

    async fn bf_exists(&self, filter: &str, item: &[u8]) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let found: bool = redis::cmd("BF.EXISTS")
            .arg(filter)
            .arg(item)
            .query_async(&mut conn)
            .await?;
        Ok(found)
    }
}

#[async_trait]
impl CuckooStore for RedisStore {
    async fn cf_reserve(
        &self,
        filter: &str,
        capacity: u64,
        bucket_size: u32,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: () = redis::cmd("CF.RESERVE")
            .arg(filter)
            .arg(capacity)
            .arg("BUCKETSIZE")
            .arg(bucket_size)
            .query_async(&mut conn)
            .await
            .map_err(|e| reserve_error(filter, e))?;
        Ok(())
    }

    async fn cf_add(&self, filter: &str, item: &[u8]) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let added: bool = redis::cmd("CF.ADD")
            .arg(filter)
            .arg(item)
            .query_async(&mut conn)
            .await?;
        Ok(added)
    }

    async fn cf_exists(&self, filter: &str, item: &[u8]) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let found: bool = redis::cmd("CF.EXISTS")
            .arg(filter)
            .arg(item)
            .query_async(&mut conn)
            .await?;
        Ok(found)
    }

    async fn cf_del(&self, filter: &str, item: &[u8]) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let removed: bool = redis::cmd("CF.DEL")
            .arg(filter)
            .arg(item)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }
}
