//! Migration Events
//!
//! Events emitted by the multi-backend migrator for monitoring.

use serde::{Deserialize, Serialize};

/// Kind of key that moved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationKind {
    Hash,
    Counter,
}

impl std::fmt::Display for MigrationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationKind::Hash => write!(f, "hash"),
            MigrationKind::Counter => write!(f, "counter"),
        }
    }
}

/// A key moved from a secondary backend into the primary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationEvent {
    pub key: String,
    pub kind: MigrationKind,
    /// Fingerprint of the backend the value came from
    pub from_backend: String,
    /// TTL carried over, `None` when the key was persistent
    pub ttl: Option<i64>,
}

impl MigrationEvent {
    pub fn hash(key: &str, from_backend: impl Into<String>, ttl: Option<i64>) -> Self {
        Self {
            key: key.to_string(),
            kind: MigrationKind::Hash,
            from_backend: from_backend.into(),
            ttl,
        }
    }

    pub fn counter(key: &str, from_backend: impl Into<String>, ttl: Option<i64>) -> Self {
        Self {
            key: key.to_string(),
            kind: MigrationKind::Counter,
            from_backend: from_backend.into(),
            ttl,
        }
    }
}
