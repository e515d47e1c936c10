//! Multi Backend
//!
//! Layers an ordered chain of backends, newest first, into one logical
//! backend. The head is the primary; the rest are older generations being
//! phased out. Keys move into the primary lazily, the first time they are
//! read (or incremented) through this backend.
//!
//! # Migration race
//!
//! Two readers hitting the same not-yet-migrated hash key may both migrate
//! it. The second primary write stores the same value and TTL, so the
//! outcome is unchanged; it only costs an extra round trip. A reader that
//! loses the race finds the secondaries already empty and re-reads the
//! primary.
//!
//! Counter migration is not idempotent: two racing first accesses to the
//! same counter can both fold the old value into the primary.

use crate::backend::events::MigrationEvent;
use crate::backend::metrics::{MultiMetrics, MultiMetricsSnapshot};
use crate::backend::{Backend, BackendRef, Expiry};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::future::try_join_all;
use std::collections::HashSet;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Capacity of the migration event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Counter operation carried through a counter migration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterOp {
    /// Read only; migrates without changing the value
    Read,
    IncrBy(i64),
    DecrBy(i64),
}

/// Backend chain with lazy migration into the primary
pub struct MultiBackend {
    primary: BackendRef,
    others: Vec<BackendRef>,
    metrics: MultiMetrics,
    event_tx: broadcast::Sender<MigrationEvent>,
}

impl MultiBackend {
    /// Build from `[newest, ..., oldest]`
    ///
    /// Fails on an empty chain or when two members share a configuration.
    pub fn new(backends: Vec<BackendRef>) -> Result<Self> {
        let fingerprints: Vec<String> = backends.iter().map(|b| b.fingerprint()).collect();
        let unique: HashSet<&String> = fingerprints.iter().collect();
        if unique.len() != fingerprints.len() {
            return Err(Error::DuplicateBackend {
                backends: fingerprints.join(", "),
            });
        }

        let mut backends = backends.into_iter();
        let primary = backends.next().ok_or_else(|| {
            Error::Configuration("multi backend needs at least one backend".to_string())
        })?;
        let others: Vec<BackendRef> = backends.collect();

        info!(
            primary = %fingerprints[0],
            secondaries = others.len(),
            "Created multi backend"
        );

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            primary,
            others,
            metrics: MultiMetrics::new(),
            event_tx,
        })
    }

    pub fn primary(&self) -> &BackendRef {
        &self.primary
    }

    /// Older generations, in lookup order
    pub fn others(&self) -> &[BackendRef] {
        &self.others
    }

    /// Subscribe to migration events
    pub fn subscribe(&self) -> broadcast::Receiver<MigrationEvent> {
        self.event_tx.subscribe()
    }

    pub fn metrics(&self) -> MultiMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn emit(&self, event: MigrationEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    async fn del_from_others(&self, key: &str) -> Result<()> {
        try_join_all(self.others.iter().map(|b| b.del(key))).await?;
        self.metrics.record_secondary_deletes(self.others.len() as u64);
        Ok(())
    }

    async fn delc_from_others(&self, key: &str) -> Result<()> {
        try_join_all(self.others.iter().map(|b| b.delc(key))).await?;
        self.metrics.record_secondary_deletes(self.others.len() as u64);
        Ok(())
    }

    /// Log copies left behind in generations older than `source`
    async fn warn_leftovers(&self, key: &str, source: usize, counter: bool) -> Result<()> {
        for backend in self.others.iter().skip(source + 1) {
            let present = if counter {
                backend.existsc(key).await?
            } else {
                backend.exists(key).await?
            };
            if present {
                warn!(
                    key,
                    backend = %backend.fingerprint(),
                    "Found leftover copy in older backend"
                );
            }
        }
        Ok(())
    }

    /// Remaining TTL of a key just read from `backend`
    ///
    /// Outer `None` when the key expired after the read; inner `None` when
    /// it is persistent.
    async fn live_pttl(
        &self,
        backend: &BackendRef,
        key: &str,
        counter: bool,
    ) -> Result<Option<Option<i64>>> {
        if let Some(millis) = backend.pttl(key).await? {
            return Ok(Some(Some(millis)));
        }
        let present = if counter {
            backend.existsc(key).await?
        } else {
            backend.exists(key).await?
        };
        if !present {
            debug!(key, backend = %backend.fingerprint(), "Key expired during migration");
            return Ok(None);
        }
        Ok(Some(None))
    }

    /// Move a hash key from the first secondary holding it into the primary
    ///
    /// The secondary's remaining TTL is carried over; every secondary copy
    /// is removed afterwards. A key that expires between the read and the
    /// TTL lookup is treated as absent.
    pub async fn migrate(&self, key: &str, expiry: Expiry) -> Result<Option<String>> {
        for (index, backend) in self.others.iter().enumerate() {
            let Some(value) = backend.get(key, expiry).await? else {
                continue;
            };
            let Some(pttl) = self.live_pttl(backend, key, false).await? else {
                continue;
            };
            self.primary.set(key, &value, Expiry::from_pttl(pttl)).await?;
            self.warn_leftovers(key, index, false).await?;
            self.del_from_others(key).await?;

            let from = backend.fingerprint();
            let ttl = pttl.map(|ms| ms / 1000);
            debug!(key, from = %from, ttl = ?ttl, "Migrated key to primary");
            self.metrics.record_hash_migration();
            self.emit(MigrationEvent::hash(key, from, ttl));
            return Ok(Some(value));
        }

        // A racing migration may have moved it already
        let value = self.primary.get(key, expiry).await?;
        if value.is_none() {
            self.metrics.record_miss();
        }
        Ok(value)
    }

    /// Fold a counter from the first secondary holding it into the primary
    ///
    /// The secondary value is added to whatever the primary holds, then
    /// `op` is applied and the secondary TTL propagated. With no secondary
    /// copy, `op` goes straight to the primary with the caller's expiry and
    /// a [`CounterOp::Read`] only re-reads the primary.
    pub async fn migratec(&self, key: &str, op: CounterOp, expiry: Expiry) -> Result<Option<i64>> {
        for (index, backend) in self.others.iter().enumerate() {
            let Some(old) = backend.getc(key, expiry).await? else {
                continue;
            };
            let Some(pttl) = self.live_pttl(backend, key, true).await? else {
                continue;
            };

            let mut value = self.primary.incrby(key, old, Expiry::Never).await?;
            value = match op {
                CounterOp::Read => value,
                CounterOp::IncrBy(amount) => self.primary.incrby(key, amount, Expiry::Never).await?,
                CounterOp::DecrBy(amount) => self.primary.decrby(key, amount, Expiry::Never).await?,
            };
            if let Some(millis) = pttl {
                self.primary.pexpire(key, millis).await?;
            }
            self.warn_leftovers(key, index, true).await?;
            self.delc_from_others(key).await?;

            let from = backend.fingerprint();
            debug!(key, from = %from, migrated = old, value, "Migrated counter to primary");
            self.metrics.record_counter_migration();
            self.emit(MigrationEvent::counter(key, from, pttl.map(|ms| ms / 1000)));
            return Ok(Some(value));
        }

        match op {
            CounterOp::Read => {
                let value = self.primary.getc(key, expiry).await?;
                if value.is_none() {
                    self.metrics.record_miss();
                }
                Ok(value)
            }
            CounterOp::IncrBy(amount) => self.primary.incrby(key, amount, expiry).await.map(Some),
            CounterOp::DecrBy(amount) => self.primary.decrby(key, amount, expiry).await.map(Some),
        }
    }

    async fn counter_op(&self, key: &str, op: CounterOp, expiry: Expiry) -> Result<i64> {
        if self.primary.existsc(key).await? {
            return match op {
                CounterOp::Read => Err(Error::Internal("read is not a counter write".to_string())),
                CounterOp::IncrBy(amount) => self.primary.incrby(key, amount, Expiry::Never).await,
                CounterOp::DecrBy(amount) => self.primary.decrby(key, amount, Expiry::Never).await,
            };
        }
        self.migratec(key, op, expiry)
            .await?
            .ok_or_else(|| Error::Internal(format!("counter write on {} returned no value", key)))
    }
}

#[async_trait]
impl Backend for MultiBackend {
    fn fingerprint(&self) -> String {
        let members: Vec<String> = std::iter::once(&self.primary)
            .chain(self.others.iter())
            .map(|b| b.fingerprint())
            .collect();
        format!("multi({})", members.join(", "))
    }

    async fn get(&self, key: &str, expiry: Expiry) -> Result<Option<String>> {
        if let Some(value) = self.primary.get(key, expiry).await? {
            self.metrics.record_primary_hit();
            return Ok(Some(value));
        }
        self.migrate(key, expiry).await
    }

    async fn set(&self, key: &str, value: &str, expiry: Expiry) -> Result<()> {
        self.del_from_others(key).await?;
        self.primary.set(key, value, expiry).await
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.del_from_others(key).await?;
        self.primary.del(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        if self.primary.exists(key).await? {
            return Ok(true);
        }
        for backend in &self.others {
            if backend.exists(key).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn getc(&self, key: &str, expiry: Expiry) -> Result<Option<i64>> {
        if let Some(value) = self.primary.getc(key, expiry).await? {
            self.metrics.record_primary_hit();
            return Ok(Some(value));
        }
        self.migratec(key, CounterOp::Read, expiry).await
    }

    async fn setc(&self, key: &str, value: i64, expiry: Expiry) -> Result<()> {
        self.delc_from_others(key).await?;
        self.primary.setc(key, value, expiry).await
    }

    async fn delc(&self, key: &str) -> Result<()> {
        self.delc_from_others(key).await?;
        self.primary.delc(key).await
    }

    async fn existsc(&self, key: &str) -> Result<bool> {
        if self.primary.existsc(key).await? {
            return Ok(true);
        }
        for backend in &self.others {
            if backend.existsc(key).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn incrby(&self, key: &str, amount: i64, expiry: Expiry) -> Result<i64> {
        self.counter_op(key, CounterOp::IncrBy(amount), expiry).await
    }

    async fn decrby(&self, key: &str, amount: i64, expiry: Expiry) -> Result<i64> {
        self.counter_op(key, CounterOp::DecrBy(amount), expiry).await
    }

    async fn expire(&self, key: &str, seconds: i64) -> Result<()> {
        self.primary.expire(key, seconds).await
    }

    async fn pexpire(&self, key: &str, millis: i64) -> Result<()> {
        self.primary.pexpire(key, millis).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<i64>> {
        if let Some(ttl) = self.primary.ttl(key).await? {
            return Ok(Some(ttl));
        }
        for backend in &self.others {
            if let Some(ttl) = backend.ttl(key).await? {
                return Ok(Some(ttl));
            }
        }
        Ok(None)
    }

    async fn pttl(&self, key: &str) -> Result<Option<i64>> {
        if let Some(pttl) = self.primary.pttl(key).await? {
            return Ok(Some(pttl));
        }
        for backend in &self.others {
            if let Some(pttl) = backend.pttl(key).await? {
                return Ok(Some(pttl));
            }
        }
        Ok(None)
    }

    async fn flush(&self) -> Result<()> {
        self.primary.flush().await?;
        try_join_all(self.others.iter().map(|b| b.flush())).await?;
        Ok(())
    }
}
