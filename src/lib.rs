//! Ephemeral Store - Per-Object Attribute and Counter Storage
//!
//! Lets application objects keep a small hash of named attributes, or
//! integer counters, in a pluggable key-value store with per-bucket expiry.
//! Several store generations can be chained so data migrates lazily from
//! the old ones into the newest on first access.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                            Entity Layer                                      │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │  EntityCache    │  │   Hash Buckets  │  │      Counter Buckets        │  │
//! │  │ (per instance)  │  │ (load once,     │  │  (uncached, seeded,         │  │
//! │  │                 │  │  merge, TTL)    │  │   atomic increments)        │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │                         │                   │
//! │           └────────────────────┼─────────────────────────┘                   │
//! │                                │                                             │
//! │                    ┌───────────┴───────────┐                                │
//! │                    │   Backend (contract)  │                                │
//! │                    └───────────┬───────────┘                                │
//! ├────────────────────────────────┼────────────────────────────────────────────┤
//! │  ┌─────────────────────────────┴───┐  ┌─────────────────────────────────┐   │
//! │  │          MultiBackend           │  │          StoreBackend           │   │
//! │  │  (newest first, lazy migrate)   │─►│  (set-with-expiry, pooled)      │   │
//! │  └─────────────────────────────────┘  └────────────────┬────────────────┘   │
//! ├────────────────────────────────────────────────────────┼────────────────────┤
//! │                          Store Drivers                 │                     │
//! │  ┌─────────────────────────────┐  ┌────────────────────┴────────────────┐   │
//! │  │        MemoryStore          │  │            FileStore                │   │
//! │  │       (memory://name)       │  │          (file:///path)             │   │
//! │  └─────────────────────────────┘  └─────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`backend`]: Backend contract, drivers, pooling and the migrator
//! - [`entity`]: Entity trait, bucket configuration, hash and counter buckets
//! - [`codec`]: Attribute values and the JSON wire format
//! - [`config`]: Global configuration and backend settings
//! - [`error`]: Error types and handling

pub mod backend;
pub mod codec;
pub mod config;
pub mod entity;
pub mod error;

// Re-export commonly used types
pub use backend::{
    Backend, BackendRef, CounterOp, Expiry, FileStore, MemoryStore, MigrationEvent,
    MigrationKind, MultiBackend, StoreBackend, StoreOptions, NEVER_EXPIRE,
};

pub use codec::{AttrValue, Attrs, JsonTypeAdapter, TimeAdapter, TypeRegistry};

pub use config::{BackendSettings, Config, StoreSpec};

pub use entity::{
    attrs, defaults, BucketOptions, CounterBucket, DefaultValue, Defaults, Entity,
    EntityStorageExt, EntityTypeConfig, ExpiresIn, Fallback, Guard, HashBucket, OperationCall,
    Retrieved, StorageState,
};

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
