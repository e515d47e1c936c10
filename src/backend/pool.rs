//! Connection Pool
//!
//! Connections are never multiplexed between concurrent callers. Each
//! checkout holds one connection exclusively and returns it to the idle
//! list on drop. A semaphore bounds how many connections are out at once:
//! a thread-safe pool lets each concurrent caller have its own, a
//! non-thread-safe pool serialises every caller on a single connection.

use crate::backend::store::{Connector, KvConnection};
use crate::error::{Error, Result};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

/// Default number of connections in a thread-safe pool
pub const DEFAULT_POOL_SIZE: usize = 16;

// =============================================================================
// Connection Pool
// =============================================================================

/// Pool of connections for one store configuration
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    idle: Mutex<Vec<Box<dyn KvConnection>>>,
    permits: Arc<Semaphore>,
    size: usize,
    thread_safe: bool,
    /// Connections opened over the pool's lifetime
    opened: AtomicU64,
}

impl ConnectionPool {
    /// Create a pool; `pool_size` only applies when `thread_safe` is set
    pub fn new(connector: Arc<dyn Connector>, thread_safe: bool, pool_size: usize) -> Arc<Self> {
        let size = if thread_safe { pool_size.max(1) } else { 1 };
        info!(
            store = %connector.fingerprint(),
            thread_safe,
            size,
            "Creating connection pool"
        );
        Arc::new(Self {
            connector,
            idle: Mutex::new(Vec::with_capacity(size)),
            permits: Arc::new(Semaphore::new(size)),
            size,
            thread_safe,
            opened: AtomicU64::new(0),
        })
    }

    pub fn fingerprint(&self) -> String {
        self.connector.fingerprint()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_thread_safe(&self) -> bool {
        self.thread_safe
    }

    /// Connections opened so far
    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    /// Connections currently idle
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Check out a connection, waiting for a free slot
    pub async fn checkout(self: &Arc<Self>) -> Result<PooledConnection> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::BackendUnavailable {
                backend: self.fingerprint(),
            })?;

        let reused = self.idle.lock().pop();
        let conn = match reused {
            Some(conn) => conn,
            None => {
                let conn = self.connector.connect().await?;
                self.opened.fetch_add(1, Ordering::Relaxed);
                debug!(
                    store = %self.fingerprint(),
                    connection_id = conn.connection_id(),
                    "Opened connection"
                );
                conn
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.clone(),
            _permit: permit,
        })
    }
}

// =============================================================================
// Pooled Connection
// =============================================================================

/// Exclusive checkout of one pooled connection
pub struct PooledConnection {
    conn: Option<Box<dyn KvConnection>>,
    pool: Arc<ConnectionPool>,
    // Released after the connection is back on the idle list
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = dyn KvConnection;

    fn deref(&self) -> &Self::Target {
        match self.conn.as_deref() {
            Some(conn) => conn,
            None => unreachable!("connection is only taken on drop"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.idle.lock().push(conn);
        }
    }
}

// =============================================================================
// Pool Registry
// =============================================================================

static GLOBAL_REGISTRY: Lazy<PoolRegistry> = Lazy::new(PoolRegistry::new);

/// Map from configuration identity to its pool
///
/// Equal configurations share one pool; different configurations never
/// share a slot.
#[derive(Default)]
pub struct PoolRegistry {
    pools: DashMap<u64, Arc<ConnectionPool>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry
    pub fn global() -> &'static PoolRegistry {
        &GLOBAL_REGISTRY
    }

    /// Stable hash of a configuration fingerprint and its thread-safety mode
    pub fn config_hash(fingerprint: &str, thread_safe: bool) -> u64 {
        let mut hasher = DefaultHasher::new();
        fingerprint.hash(&mut hasher);
        thread_safe.hash(&mut hasher);
        hasher.finish()
    }

    /// Get or create the pool for a connector
    pub fn pool_for(
        &self,
        connector: Arc<dyn Connector>,
        thread_safe: bool,
        pool_size: usize,
    ) -> Arc<ConnectionPool> {
        let key = Self::config_hash(&connector.fingerprint(), thread_safe);
        self.pools
            .entry(key)
            .or_insert_with(|| ConnectionPool::new(connector, thread_safe, pool_size))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}
