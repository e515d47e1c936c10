//! Store Clocks
//!
//! Drivers read the current time through a [`Clock`] so TTL arithmetic can
//! be driven deterministically in tests.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Source of the current time for TTL bookkeeping
pub trait Clock: Send + Sync {
    /// Current time as Unix epoch milliseconds
    fn now_ms(&self) -> i64;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Manually advanced clock for deterministic tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    /// Start at the current wall-clock time
    pub fn new() -> Arc<Self> {
        Self::starting_at(Utc::now().timestamp_millis())
    }

    pub fn starting_at(now_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            now_ms: AtomicI64::new(now_ms),
        })
    }

    pub fn advance_secs(&self, seconds: i64) {
        self.now_ms.fetch_add(seconds * 1000, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, millis: i64) {
        self.now_ms.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Shared clock handle
pub type ClockRef = Arc<dyn Clock>;

/// Default clock handle
pub fn system_clock() -> ClockRef {
    Arc::new(SystemClock)
}
