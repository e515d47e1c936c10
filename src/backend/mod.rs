//! Storage Backends
//!
//! The backend contract every storage driver implements, plus the two
//! logical backends built on top of it:
//!
//! - [`StoreBackend`]: a direct adapter to one key-value store, applying
//!   value and TTL writes as one atomic unit
//! - [`MultiBackend`]: layers an ordered chain of backends (newest first)
//!   into one, lazily migrating keys out of older generations on read
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Backend (contract)                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────────────────┐   ┌─────────────────────────────┐ │
//! │  │          MultiBackend            │   │        StoreBackend         │ │
//! │  │  primary ◄── migrate ── others   │──►│  set-with-expiry (atomic)   │ │
//! │  └──────────────────────────────────┘   └──────────────┬──────────────┘ │
//! │                                                        │                │
//! │                                          ┌─────────────┴────────────┐   │
//! │                                          │  ConnectionPool          │   │
//! │                                          │  (per config fingerprint)│   │
//! │                                          └─────────────┬────────────┘   │
//! ├────────────────────────────────────────────────────────┼────────────────┤
//! │                         KvConnection drivers           │                │
//! │        ┌──────────────────────┐   ┌────────────────────┴─────┐          │
//! │        │  MemoryStore         │   │  FileStore               │          │
//! │        │  (DashMap, named)    │   │  (sharded JSON records)  │          │
//! │        └──────────────────────┘   └──────────────────────────┘          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod clock;
pub mod events;
pub mod file;
pub mod memory;
pub mod metrics;
pub mod multi;
pub mod pool;
pub mod single;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use events::{MigrationEvent, MigrationKind};
pub use file::{FileConnector, FileStore};
pub use memory::{MemoryConnector, MemoryStore};
pub use metrics::{BackendMetrics, BackendMetricsSnapshot, MultiMetrics, MultiMetricsSnapshot};
pub use multi::{CounterOp, MultiBackend};
pub use pool::{ConnectionPool, PoolRegistry, PooledConnection};
pub use single::{StoreBackend, StoreOptions};
pub use store::{Command, Connector, KeyTtl, KvConnection, Reply};

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Expiry
// =============================================================================

/// Expiry applied to a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expiry {
    /// Write without touching the key's TTL
    #[default]
    Never,
    /// Expire the key this many seconds after the write
    Seconds(i64),
    /// Expire the key this many milliseconds after the write
    ///
    /// Carries a remaining TTL read back with [`Backend::pttl`] so a
    /// rewrite keeps the original deadline.
    Millis(i64),
}

/// Sentinel for "never expire"
pub const NEVER_EXPIRE: Expiry = Expiry::Never;

impl Expiry {
    /// Build from a remaining TTL as reported by [`Backend::ttl`]
    pub fn from_ttl(ttl: Option<i64>) -> Self {
        match ttl {
            Some(seconds) => Expiry::Seconds(seconds),
            None => Expiry::Never,
        }
    }

    /// Build from a remaining TTL as reported by [`Backend::pttl`]
    pub fn from_pttl(pttl: Option<i64>) -> Self {
        match pttl {
            Some(millis) => Expiry::Millis(millis),
            None => Expiry::Never,
        }
    }

    /// Whole seconds to expiry, rounded down
    pub fn seconds(&self) -> Option<i64> {
        self.millis().map(|ms| ms / 1000)
    }

    pub fn millis(&self) -> Option<i64> {
        match self {
            Expiry::Never => None,
            Expiry::Seconds(s) => Some(s.saturating_mul(1000)),
            Expiry::Millis(ms) => Some(*ms),
        }
    }

    pub fn is_never(&self) -> bool {
        matches!(self, Expiry::Never)
    }
}

impl fmt::Display for Expiry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expiry::Never => write!(f, "never"),
            Expiry::Seconds(s) => write!(f, "{}s", s),
            Expiry::Millis(ms) => write!(f, "{}ms", ms),
        }
    }
}

// =============================================================================
// Backend Trait (Port)
// =============================================================================

/// The contract every storage backend implements
///
/// Keys are opaque strings. Hash values are serialized blobs; counters are
/// integers. A bucket is either hash-typed or counter-typed, so the two
/// families never address the same key even though drivers may share one
/// key space.
///
/// Absent keys are `Ok(None)` / `Ok(false)`, never errors. Keys whose TTL
/// has elapsed are absent even if the store has not reaped them yet.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Configuration identity of this backend
    ///
    /// Two backends with the same fingerprint address the same data.
    fn fingerprint(&self) -> String;

    // -------------------------------------------------------------------------
    // Hashes
    // -------------------------------------------------------------------------

    /// Read a blob. `expiry` is the caller's configured expiry, passed
    /// through for backends that write on read.
    async fn get(&self, key: &str, expiry: Expiry) -> Result<Option<String>>;

    /// Write a blob, applying `expiry` atomically with the write
    async fn set(&self, key: &str, value: &str, expiry: Expiry) -> Result<()>;

    /// Delete a key; idempotent
    async fn del(&self, key: &str) -> Result<()>;

    /// Check that a live key exists
    async fn exists(&self, key: &str) -> Result<bool>;

    // -------------------------------------------------------------------------
    // Counters
    // -------------------------------------------------------------------------

    async fn getc(&self, key: &str, expiry: Expiry) -> Result<Option<i64>>;

    async fn setc(&self, key: &str, value: i64, expiry: Expiry) -> Result<()>;

    async fn delc(&self, key: &str) -> Result<()> {
        self.del(key).await
    }

    async fn existsc(&self, key: &str) -> Result<bool> {
        self.exists(key).await
    }

    async fn incr(&self, key: &str, expiry: Expiry) -> Result<i64> {
        self.incrby(key, 1, expiry).await
    }

    async fn decr(&self, key: &str, expiry: Expiry) -> Result<i64> {
        self.decrby(key, 1, expiry).await
    }

    async fn incrby(&self, key: &str, amount: i64, expiry: Expiry) -> Result<i64>;

    async fn decrby(&self, key: &str, amount: i64, expiry: Expiry) -> Result<i64>;

    // -------------------------------------------------------------------------
    // Expiry / TTL
    // -------------------------------------------------------------------------

    /// Set or refresh the TTL of a key
    async fn expire(&self, key: &str, seconds: i64) -> Result<()>;

    /// Millisecond form of [`Backend::expire`]
    async fn pexpire(&self, key: &str, millis: i64) -> Result<()>;

    /// Remaining TTL in whole seconds, rounded down
    ///
    /// `None` both when the key has no TTL and when it is absent; call
    /// [`Backend::exists`] first when the distinction matters.
    async fn ttl(&self, key: &str) -> Result<Option<i64>>;

    /// Remaining TTL in milliseconds, with the same `None` cases as
    /// [`Backend::ttl`]
    async fn pttl(&self, key: &str) -> Result<Option<i64>>;

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Clear all state
    async fn flush(&self) -> Result<()>;
}

/// Type alias for a shared backend
pub type BackendRef = Arc<dyn Backend>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_from_ttl() {
        assert_eq!(Expiry::from_ttl(None), NEVER_EXPIRE);
        assert_eq!(Expiry::from_ttl(Some(55)), Expiry::Seconds(55));
        assert_eq!(Expiry::Seconds(55).seconds(), Some(55));
        assert!(Expiry::Never.is_never());
        assert_eq!(Expiry::Seconds(10).to_string(), "10s");

        assert_eq!(Expiry::from_pttl(Some(9_400)), Expiry::Millis(9_400));
        assert_eq!(Expiry::Millis(9_400).seconds(), Some(9));
        assert_eq!(Expiry::Seconds(3).millis(), Some(3_000));
        assert_eq!(Expiry::Millis(250).to_string(), "250ms");
    }
}
