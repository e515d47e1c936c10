//! Backend Metrics
//!
//! Cache-line aligned counters for concurrent access from every caller of
//! a backend.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache line size for alignment (64 bytes on most modern CPUs)
pub const CACHE_LINE_SIZE: usize = 64;

// =============================================================================
// Single Store Metrics
// =============================================================================

/// Operation counters for one [`StoreBackend`](crate::backend::StoreBackend)
#[repr(C, align(64))]
#[derive(Debug)]
pub struct BackendMetrics {
    /// Reads that found a value
    pub hits: AtomicU64,
    /// Reads that found nothing
    pub misses: AtomicU64,
    /// Hash and counter writes
    pub writes: AtomicU64,
    /// Deletes
    pub deletes: AtomicU64,
    /// Increments and decrements
    pub counter_ops: AtomicU64,
    /// Operations that failed
    pub errors: AtomicU64,
    /// Last update timestamp (Unix millis)
    pub last_update_ms: AtomicU64,
    _padding: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<BackendMetrics>() <= CACHE_LINE_SIZE);

impl Default for BackendMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendMetrics {
    pub fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            counter_ops: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_update_ms: AtomicU64::new(0),
            _padding: [0; 8],
        }
    }

    /// Record a read, hit or miss
    #[inline]
    pub fn record_read(&self, found: bool) {
        if found {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        self.touch();
    }

    #[inline]
    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_counter_op(&self) {
        self.counter_ops.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    fn touch(&self) {
        self.last_update_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::Release);
    }

    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        self.snapshot().hit_ratio()
    }

    pub fn snapshot(&self) -> BackendMetricsSnapshot {
        BackendMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            counter_ops: self.counter_ops.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of [`BackendMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub deletes: u64,
    pub counter_ops: u64,
    pub errors: u64,
}

impl BackendMetricsSnapshot {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn total_reads(&self) -> u64 {
        self.hits + self.misses
    }
}

// =============================================================================
// Multi-Backend Metrics
// =============================================================================

/// Migration counters for a [`MultiBackend`](crate::backend::MultiBackend)
#[repr(C, align(64))]
#[derive(Debug)]
pub struct MultiMetrics {
    /// Reads served by the primary
    pub primary_hits: AtomicU64,
    /// Hash keys moved from a secondary
    pub hash_migrations: AtomicU64,
    /// Counter keys folded in from secondaries
    pub counter_migrations: AtomicU64,
    /// Reads that missed every backend
    pub misses: AtomicU64,
    /// Secondary copies removed (migration or write-through delete)
    pub secondary_deletes: AtomicU64,
    _padding: [u8; 24],
}

const _: () = assert!(std::mem::size_of::<MultiMetrics>() <= CACHE_LINE_SIZE);

impl Default for MultiMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiMetrics {
    pub fn new() -> Self {
        Self {
            primary_hits: AtomicU64::new(0),
            hash_migrations: AtomicU64::new(0),
            counter_migrations: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            secondary_deletes: AtomicU64::new(0),
            _padding: [0; 24],
        }
    }

    #[inline]
    pub fn record_primary_hit(&self) {
        self.primary_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_hash_migration(&self) {
        self.hash_migrations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_counter_migration(&self) {
        self.counter_migrations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_secondary_deletes(&self, count: u64) {
        self.secondary_deletes.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MultiMetricsSnapshot {
        MultiMetricsSnapshot {
            primary_hits: self.primary_hits.load(Ordering::Relaxed),
            hash_migrations: self.hash_migrations.load(Ordering::Relaxed),
            counter_migrations: self.counter_migrations.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            secondary_deletes: self.secondary_deletes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of [`MultiMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiMetricsSnapshot {
    pub primary_hits: u64,
    pub hash_migrations: u64,
    pub counter_migrations: u64,
    pub misses: u64,
    pub secondary_deletes: u64,
}

impl MultiMetricsSnapshot {
    /// Total keys migrated into the primary
    pub fn total_migrations(&self) -> u64 {
        self.hash_migrations + self.counter_migrations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_line_alignment() {
        assert_eq!(std::mem::align_of::<BackendMetrics>(), CACHE_LINE_SIZE);
        assert_eq!(std::mem::align_of::<MultiMetrics>(), CACHE_LINE_SIZE);
    }

    #[test]
    fn test_backend_metrics_operations() {
        let metrics = BackendMetrics::new();

        metrics.record_read(true);
        metrics.record_read(true);
        metrics.record_read(false);
        metrics.record_write();
        metrics.record_counter_op();
        metrics.record_error();

        let snap = metrics.snapshot();
        assert_eq!(snap.hits, 2);
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.total_reads(), 3);
        assert_eq!(snap.writes, 1);
        assert_eq!(snap.counter_ops, 1);
        assert_eq!(snap.errors, 1);
        assert!((metrics.hit_ratio() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_multi_metrics_snapshot() {
        let metrics = MultiMetrics::new();
        metrics.record_hash_migration();
        metrics.record_counter_migration();
        metrics.record_counter_migration();
        metrics.record_secondary_deletes(3);

        let snap = metrics.snapshot();
        assert_eq!(snap.total_migrations(), 3);
        assert_eq!(snap.secondary_deletes, 3);
        assert_eq!(snap.primary_hits, 0);
    }
}
