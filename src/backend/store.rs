//! Store Connection Contract
//!
//! The native primitives a key-value store driver exposes. The
//! [`StoreBackend`](crate::backend::StoreBackend) builds the backend
//! contract on top of these.

use crate::error::Result;
use async_trait::async_trait;

// =============================================================================
// TTL State
// =============================================================================

/// TTL state of a key as the store sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key is absent (or expired)
    Missing,
    /// Key exists without an expiry
    Persistent,
    /// Key expires in this many milliseconds
    Expires(i64),
}

impl KeyTtl {
    /// Remaining whole seconds, rounded down; `None` when absent or persistent
    pub fn remaining(&self) -> Option<i64> {
        self.remaining_ms().map(|ms| ms / 1000)
    }

    pub fn remaining_ms(&self) -> Option<i64> {
        match self {
            KeyTtl::Expires(ms) => Some(*ms),
            KeyTtl::Missing | KeyTtl::Persistent => None,
        }
    }
}

// =============================================================================
// Atomic Batches
// =============================================================================

/// A command inside an atomic batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set { key: String, value: String },
    IncrBy { key: String, delta: i64 },
    Expire { key: String, seconds: i64 },
    PExpire { key: String, millis: i64 },
}

impl Command {
    pub fn key(&self) -> &str {
        match self {
            Command::Set { key, .. }
            | Command::IncrBy { key, .. }
            | Command::Expire { key, .. }
            | Command::PExpire { key, .. } => key,
        }
    }
}

/// Reply to a command inside an atomic batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Int(i64),
    Bool(bool),
}

impl Reply {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Reply::Int(v) => Some(*v),
            _ => None,
        }
    }
}

// =============================================================================
// KvConnection Trait
// =============================================================================

/// One connection to a key-value store
///
/// A connection is used by one caller at a time; the pool hands out
/// exclusive checkouts.
#[async_trait]
pub trait KvConnection: Send + Sync {
    /// Unique id of this connection (for diagnostics)
    fn connection_id(&self) -> u64;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value, clearing any TTL the key had
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a key, returning whether it existed
    async fn del(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Add `delta` to the integer at `key`, keeping its TTL
    ///
    /// A missing key counts from zero.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;

    /// Set a TTL; zero or negative seconds delete the key
    async fn expire(&self, key: &str, seconds: i64) -> Result<bool>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl>;

    async fn flush(&self) -> Result<()>;

    /// Apply a batch of commands as one unit
    ///
    /// Replies are returned in command order.
    async fn atomic(&self, commands: Vec<Command>) -> Result<Vec<Reply>>;
}

// =============================================================================
// Connector Trait
// =============================================================================

/// Opens connections for one store configuration
#[async_trait]
pub trait Connector: Send + Sync {
    /// Stable description of the configuration this connector targets
    fn fingerprint(&self) -> String;

    async fn connect(&self) -> Result<Box<dyn KvConnection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ttl_remaining() {
        assert_eq!(KeyTtl::Expires(10_000).remaining(), Some(10));
        assert_eq!(KeyTtl::Expires(9_999).remaining(), Some(9));
        assert_eq!(KeyTtl::Expires(400).remaining(), Some(0));
        assert_eq!(KeyTtl::Expires(9_999).remaining_ms(), Some(9_999));
        assert_eq!(KeyTtl::Persistent.remaining(), None);
        assert_eq!(KeyTtl::Missing.remaining(), None);
    }

    #[test]
    fn test_command_key() {
        let cmd = Command::IncrBy {
            key: "Counter-1-stars".into(),
            delta: 3,
        };
        assert_eq!(cmd.key(), "Counter-1-stars");
        assert_eq!(Reply::Int(4).as_int(), Some(4));
        assert_eq!(Reply::Ok.as_int(), None);
    }
}
