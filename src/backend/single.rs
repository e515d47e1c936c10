//! Single-Store Backend
//!
//! Adapts one key-value store to the [`Backend`] contract. Writes that carry
//! an expiry are sent as one atomic batch (`write` + `expire`) so a reader
//! never observes the new value with a stale or missing TTL.

use crate::backend::file::FileConnector;
use crate::backend::memory::MemoryConnector;
use crate::backend::metrics::{BackendMetrics, BackendMetricsSnapshot};
use crate::backend::pool::{ConnectionPool, PoolRegistry, PooledConnection, DEFAULT_POOL_SIZE};
use crate::backend::store::{Command, Connector, Reply};
use crate::backend::{Backend, Expiry};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Options
// =============================================================================

/// Connection options for a [`StoreBackend`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Give each concurrent caller its own connection
    pub thread_safe: bool,
    /// Upper bound on connections when `thread_safe` is set
    pub pool_size: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            thread_safe: false,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

impl StoreOptions {
    pub fn thread_safe() -> Self {
        Self {
            thread_safe: true,
            ..Default::default()
        }
    }
}

// =============================================================================
// Store Backend
// =============================================================================

/// Backend over a single key-value store
pub struct StoreBackend {
    fingerprint: String,
    pool: Arc<ConnectionPool>,
    metrics: BackendMetrics,
}

impl StoreBackend {
    /// Create a backend sharing the process-wide pool for this configuration
    pub fn new(connector: Arc<dyn Connector>, options: StoreOptions) -> Self {
        let pool =
            PoolRegistry::global().pool_for(connector, options.thread_safe, options.pool_size);
        Self::with_pool(pool)
    }

    /// Create a backend over an explicit pool
    pub fn with_pool(pool: Arc<ConnectionPool>) -> Self {
        let fingerprint = pool.fingerprint();
        info!(store = %fingerprint, thread_safe = pool.is_thread_safe(), "Created store backend");
        Self {
            fingerprint,
            pool,
            metrics: BackendMetrics::new(),
        }
    }

    /// Backend over the named in-memory store
    pub fn memory(name: &str) -> Self {
        Self::new(Arc::new(MemoryConnector::named(name)), StoreOptions::default())
    }

    /// Backend over a directory store, creating the directory if needed
    pub fn file(path: impl AsRef<Path>) -> Result<Self> {
        let connector = FileConnector::open(path)?;
        Ok(Self::new(Arc::new(connector), StoreOptions::default()))
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn metrics(&self) -> BackendMetricsSnapshot {
        self.metrics.snapshot()
    }

    async fn conn(&self) -> Result<PooledConnection> {
        self.track(self.pool.checkout().await)
    }

    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.metrics.record_error();
        }
        result
    }

    /// Apply a write, with its expiry in the same atomic batch
    ///
    /// Returns the write's reply, not the expire's.
    async fn set_with_expiry(&self, command: Command, expiry: Expiry) -> Result<Reply> {
        let conn = self.conn().await?;
        let result = match expiry.millis() {
            None => match command {
                Command::Set { key, value } => conn.set(&key, &value).await.map(|_| Reply::Ok),
                Command::IncrBy { key, delta } => conn.incr_by(&key, delta).await.map(Reply::Int),
                Command::Expire { key, seconds } => {
                    conn.expire(&key, seconds).await.map(Reply::Bool)
                }
                command @ Command::PExpire { .. } => {
                    self.first_reply(conn.atomic(vec![command]).await)
                }
            },
            Some(millis) => {
                let key = command.key().to_string();
                debug!(key = %key, expiry = %expiry, "Writing with expiry");
                let batch = vec![command, Command::PExpire { key, millis }];
                self.first_reply(conn.atomic(batch).await)
            }
        };
        self.track(result)
    }

    fn first_reply(&self, replies: Result<Vec<Reply>>) -> Result<Reply> {
        replies.and_then(|replies| {
            replies
                .into_iter()
                .next()
                .ok_or_else(|| Error::backend(&self.fingerprint, "atomic", "empty reply"))
        })
    }

    async fn apply_delta(&self, key: &str, delta: i64, expiry: Expiry) -> Result<i64> {
        self.metrics.record_counter_op();
        let reply = self
            .set_with_expiry(
                Command::IncrBy {
                    key: key.to_string(),
                    delta,
                },
                expiry,
            )
            .await?;
        reply
            .as_int()
            .ok_or_else(|| Error::backend(&self.fingerprint, "incr_by", "non-integer reply"))
    }
}

#[async_trait]
impl Backend for StoreBackend {
    fn fingerprint(&self) -> String {
        self.fingerprint.clone()
    }

    async fn get(&self, key: &str, _expiry: Expiry) -> Result<Option<String>> {
        let conn = self.conn().await?;
        let value = self.track(conn.get(key).await)?;
        self.metrics.record_read(value.is_some());
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, expiry: Expiry) -> Result<()> {
        self.set_with_expiry(
            Command::Set {
                key: key.to_string(),
                value: value.to_string(),
            },
            expiry,
        )
        .await?;
        self.metrics.record_write();
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let conn = self.conn().await?;
        self.track(conn.del(key).await)?;
        self.metrics.record_delete();
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let conn = self.conn().await?;
        self.track(conn.exists(key).await)
    }

    async fn getc(&self, key: &str, expiry: Expiry) -> Result<Option<i64>> {
        match self.get(key, expiry).await? {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<i64>().map(Some).map_err(|_| {
                self.metrics.record_error();
                Error::InvalidCounter {
                    key: key.to_string(),
                    value: raw,
                }
            }),
        }
    }

    async fn setc(&self, key: &str, value: i64, expiry: Expiry) -> Result<()> {
        self.set(key, &value.to_string(), expiry).await
    }

    async fn incrby(&self, key: &str, amount: i64, expiry: Expiry) -> Result<i64> {
        self.apply_delta(key, amount, expiry).await
    }

    async fn decrby(&self, key: &str, amount: i64, expiry: Expiry) -> Result<i64> {
        let delta = amount
            .checked_neg()
            .ok_or_else(|| Error::Configuration(format!("cannot decrement by {}", amount)))?;
        self.apply_delta(key, delta, expiry).await
    }

    async fn expire(&self, key: &str, seconds: i64) -> Result<()> {
        let conn = self.conn().await?;
        self.track(conn.expire(key, seconds).await)?;
        Ok(())
    }

    async fn pexpire(&self, key: &str, millis: i64) -> Result<()> {
        let conn = self.conn().await?;
        let command = Command::PExpire {
            key: key.to_string(),
            millis,
        };
        self.track(conn.atomic(vec![command]).await)?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<i64>> {
        let conn = self.conn().await?;
        Ok(self.track(conn.ttl(key).await)?.remaining())
    }

    async fn pttl(&self, key: &str) -> Result<Option<i64>> {
        let conn = self.conn().await?;
        Ok(self.track(conn.ttl(key).await)?.remaining_ms())
    }

    async fn flush(&self) -> Result<()> {
        let conn = self.conn().await?;
        info!(store = %self.fingerprint, "Flushing store");
        self.track(conn.flush().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::clock::ManualClock;
    use crate::backend::memory::MemoryStore;
    use assert_matches::assert_matches;

    fn backend(name: &str) -> (StoreBackend, Arc<ManualClock>) {
        let clock = ManualClock::new();
        let store = MemoryStore::with_clock(&format!("single-tests-{}", name), clock.clone());
        let connector = Arc::new(MemoryConnector::for_store(store));
        let pool = ConnectionPool::new(connector, false, 1);
        (StoreBackend::with_pool(pool), clock)
    }

    #[tokio::test]
    async fn test_hash_roundtrip() {
        let (backend, _clock) = backend("hash");

        assert_eq!(backend.get("Post-1", Expiry::Never).await.unwrap(), None);
        backend.set("Post-1", "{\"a\":1}", Expiry::Never).await.unwrap();
        assert_eq!(
            backend.get("Post-1", Expiry::Never).await.unwrap().as_deref(),
            Some("{\"a\":1}")
        );
        assert!(backend.exists("Post-1").await.unwrap());
        assert_eq!(backend.ttl("Post-1").await.unwrap(), None);

        backend.del("Post-1").await.unwrap();
        backend.del("Post-1").await.unwrap();
        assert!(!backend.exists("Post-1").await.unwrap());

        let metrics = backend.metrics();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.writes, 1);
        assert_eq!(metrics.deletes, 2);
    }

    #[tokio::test]
    async fn test_set_with_expiry_is_applied() {
        let (backend, clock) = backend("expiry");

        backend.set("k", "v", Expiry::Seconds(60)).await.unwrap();
        assert_eq!(backend.ttl("k").await.unwrap(), Some(60));

        clock.advance_secs(5);
        assert_eq!(backend.ttl("k").await.unwrap(), Some(55));

        clock.advance_secs(55);
        assert_eq!(backend.get("k", Expiry::Never).await.unwrap(), None);
        assert!(!backend.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_millisecond_expiry_keeps_deadline() {
        let (backend, clock) = backend("pttl");

        backend.set("k", "v", Expiry::Seconds(10)).await.unwrap();
        clock.advance_ms(400);
        assert_eq!(backend.pttl("k").await.unwrap(), Some(9_600));
        assert_eq!(backend.ttl("k").await.unwrap(), Some(9));

        // Rewriting with the remaining TTL leaves the deadline unchanged
        let remaining = backend.pttl("k").await.unwrap();
        backend.set("k", "w", Expiry::from_pttl(remaining)).await.unwrap();
        clock.advance_ms(9_599);
        assert!(backend.exists("k").await.unwrap());
        clock.advance_ms(1);
        assert!(!backend.exists("k").await.unwrap());

        backend.set("k", "v", Expiry::Never).await.unwrap();
        backend.pexpire("k", 250).await.unwrap();
        assert_eq!(backend.pttl("k").await.unwrap(), Some(250));
        assert_eq!(backend.ttl("k").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_counters() {
        let (backend, _clock) = backend("counters");

        assert_eq!(backend.getc("c", Expiry::Never).await.unwrap(), None);
        assert_eq!(backend.incr("c", Expiry::Never).await.unwrap(), 1);
        assert_eq!(backend.incrby("c", 4, Expiry::Never).await.unwrap(), 5);
        assert_eq!(backend.decr("c", Expiry::Never).await.unwrap(), 4);
        assert_eq!(backend.decrby("c", 10, Expiry::Never).await.unwrap(), -6);
        assert_eq!(backend.getc("c", Expiry::Never).await.unwrap(), Some(-6));

        backend.setc("c", 42, Expiry::Seconds(30)).await.unwrap();
        assert_eq!(backend.getc("c", Expiry::Never).await.unwrap(), Some(42));
        assert_eq!(backend.ttl("c").await.unwrap(), Some(30));

        backend.delc("c").await.unwrap();
        assert!(!backend.existsc("c").await.unwrap());
    }

    #[tokio::test]
    async fn test_incr_with_expiry_returns_counter_value() {
        let (backend, _clock) = backend("incr-expiry");
        assert_eq!(backend.incrby("c", 3, Expiry::Seconds(10)).await.unwrap(), 3);
        assert_eq!(backend.ttl("c").await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_getc_on_hash_value_fails() {
        let (backend, _clock) = backend("invalid-counter");
        backend.set("k", "{}", Expiry::Never).await.unwrap();
        let err = backend.getc("k", Expiry::Never).await.unwrap_err();
        assert_matches!(err, Error::InvalidCounter { .. });
    }

    #[tokio::test]
    async fn test_flush() {
        let (backend, _clock) = backend("flush");
        backend.set("a", "1", Expiry::Never).await.unwrap();
        backend.setc("b", 1, Expiry::Never).await.unwrap();
        backend.flush().await.unwrap();
        assert!(!backend.exists("a").await.unwrap());
        assert!(!backend.exists("b").await.unwrap());
    }

    #[test]
    fn test_fingerprint() {
        let backend = StoreBackend::memory("single-tests-fingerprint");
        assert_eq!(backend.fingerprint(), "memory://single-tests-fingerprint");
    }
}
