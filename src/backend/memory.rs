//! In-Memory Store
//!
//! Process-wide named key-value stores backed by DashMap. Stores are
//! addressed as `memory://<name>`; every connection to the same name sees
//! the same data, the way connections to one server database would.

use crate::backend::clock::{system_clock, ClockRef};
use crate::backend::store::{Command, Connector, KeyTtl, KvConnection, Reply};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Registry of named stores
static STORES: Lazy<DashMap<String, Arc<MemoryStore>>> = Lazy::new(DashMap::new);

/// Connection id source shared by all in-memory connections
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Stored Value
// =============================================================================

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    /// Absolute expiry (Unix millis), `None` = persistent
    expires_at_ms: Option<i64>,
}

impl StoredValue {
    fn persistent(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            expires_at_ms: None,
        }
    }

    #[inline]
    fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at_ms.map_or(true, |at| at > now_ms)
    }
}

// =============================================================================
// Memory Store
// =============================================================================

/// In-memory key-value store with TTL support
///
/// Expired keys are reaped lazily, on the first access after expiry.
pub struct MemoryStore {
    name: String,
    entries: DashMap<String, StoredValue>,
    /// Single operations share the lock; atomic batches take it exclusively
    batch_lock: RwLock<()>,
    clock: ClockRef,
}

impl MemoryStore {
    /// Get or create the named store
    pub fn named(name: &str) -> Arc<Self> {
        STORES
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Self::unregistered(name, system_clock())))
            .clone()
    }

    /// Create (or replace) the named store with an explicit clock
    pub fn with_clock(name: &str, clock: ClockRef) -> Arc<Self> {
        let store = Arc::new(Self::unregistered(name, clock));
        STORES.insert(name.to_string(), store.clone());
        store
    }

    fn unregistered(name: &str, clock: ClockRef) -> Self {
        debug!(store = name, "Created in-memory store");
        Self {
            name: name.to_string(),
            entries: DashMap::new(),
            batch_lock: RwLock::new(()),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store address
    pub fn url(&self) -> String {
        format!("memory://{}", self.name)
    }

    /// Number of keys held, including expired keys not yet reaped
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // -------------------------------------------------------------------------
    // Unlocked primitives
    // -------------------------------------------------------------------------

    fn live(&self, key: &str) -> Option<StoredValue> {
        let now = self.clock.now_ms();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => return Some(entry.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, v| !v.is_live(now));
        }
        None
    }

    fn set_unlocked(&self, key: &str, value: &str) {
        self.entries
            .insert(key.to_string(), StoredValue::persistent(value));
    }

    fn incr_by_unlocked(&self, key: &str, delta: i64) -> Result<i64> {
        let now = self.clock.now_ms();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredValue::persistent("0"));
        if !entry.is_live(now) {
            *entry = StoredValue::persistent("0");
        }

        let current: i64 = entry
            .value
            .parse()
            .map_err(|_| Error::backend(self.url(), "incr_by", "value is not an integer"))?;
        let next = current
            .checked_add(delta)
            .ok_or_else(|| Error::backend(self.url(), "incr_by", "increment would overflow"))?;
        entry.value = next.to_string();
        Ok(next)
    }

    fn expire_unlocked(&self, key: &str, millis: i64) -> bool {
        if self.live(key).is_none() {
            return false;
        }
        if millis <= 0 {
            self.entries.remove(key);
            return true;
        }
        let at = self.clock.now_ms().saturating_add(millis);
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at_ms = Some(at);
                true
            }
            None => false,
        }
    }

    fn ttl_unlocked(&self, key: &str) -> KeyTtl {
        match self.live(key) {
            None => KeyTtl::Missing,
            Some(StoredValue {
                expires_at_ms: None,
                ..
            }) => KeyTtl::Persistent,
            Some(StoredValue {
                expires_at_ms: Some(at),
                ..
            }) => {
                KeyTtl::Expires((at - self.clock.now_ms()).max(0))
            }
        }
    }

    fn apply(&self, command: Command) -> Result<Reply> {
        match command {
            Command::Set { key, value } => {
                self.set_unlocked(&key, &value);
                Ok(Reply::Ok)
            }
            Command::IncrBy { key, delta } => self.incr_by_unlocked(&key, delta).map(Reply::Int),
            Command::Expire { key, seconds } => Ok(Reply::Bool(
                self.expire_unlocked(&key, seconds.saturating_mul(1000)),
            )),
            Command::PExpire { key, millis } => Ok(Reply::Bool(self.expire_unlocked(&key, millis))),
        }
    }

    // -------------------------------------------------------------------------
    // Locked operations
    // -------------------------------------------------------------------------

    pub fn get(&self, key: &str) -> Option<String> {
        let _guard = self.batch_lock.read();
        self.live(key).map(|v| v.value)
    }

    pub fn set(&self, key: &str, value: &str) {
        let _guard = self.batch_lock.read();
        self.set_unlocked(key, value);
    }

    pub fn del(&self, key: &str) -> bool {
        let _guard = self.batch_lock.read();
        let now = self.clock.now_ms();
        self.entries
            .remove(key)
            .map(|(_, v)| v.is_live(now))
            .unwrap_or(false)
    }

    pub fn exists(&self, key: &str) -> bool {
        let _guard = self.batch_lock.read();
        self.live(key).is_some()
    }

    pub fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let _guard = self.batch_lock.read();
        self.incr_by_unlocked(key, delta)
    }

    pub fn expire(&self, key: &str, seconds: i64) -> bool {
        let _guard = self.batch_lock.read();
        self.expire_unlocked(key, seconds.saturating_mul(1000))
    }

    pub fn ttl(&self, key: &str) -> KeyTtl {
        let _guard = self.batch_lock.read();
        self.ttl_unlocked(key)
    }

    pub fn flush(&self) {
        let _guard = self.batch_lock.write();
        self.entries.clear();
    }

    /// Apply a batch with no other operation interleaved
    pub fn atomic(&self, commands: Vec<Command>) -> Result<Vec<Reply>> {
        let _guard = self.batch_lock.write();
        commands.into_iter().map(|c| self.apply(c)).collect()
    }
}

// =============================================================================
// Connection & Connector
// =============================================================================

/// Connection to a named in-memory store
pub struct MemoryConnection {
    store: Arc<MemoryStore>,
    id: u64,
}

#[async_trait]
impl KvConnection for MemoryConnection {
    fn connection_id(&self) -> u64 {
        self.id
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.store.get(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.store.set(key, value);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        Ok(self.store.del(key))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.store.exists(key))
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        self.store.incr_by(key, delta)
    }

    async fn expire(&self, key: &str, seconds: i64) -> Result<bool> {
        Ok(self.store.expire(key, seconds))
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        Ok(self.store.ttl(key))
    }

    async fn flush(&self) -> Result<()> {
        self.store.flush();
        Ok(())
    }

    async fn atomic(&self, commands: Vec<Command>) -> Result<Vec<Reply>> {
        self.store.atomic(commands)
    }
}

/// Connector for `memory://<name>`
#[derive(Clone)]
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
}

impl MemoryConnector {
    /// Connect to the named store, creating it on first use
    pub fn named(name: &str) -> Self {
        Self {
            store: MemoryStore::named(name),
        }
    }

    pub fn for_store(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn fingerprint(&self) -> String {
        self.store.url()
    }

    async fn connect(&self) -> Result<Box<dyn KvConnection>> {
        Ok(Box::new(MemoryConnection {
            store: self.store.clone(),
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
        }))
    }
}

// =============================================================================
// Tests
// =============================================================================
