//! Per-instance bucket cache

use crate::codec::Attrs;
use std::collections::HashMap;

/// Slot name of the default bucket
pub(crate) const DEFAULT_BUCKET: &str = "";

pub(crate) fn slot(bucket: Option<&str>) -> &str {
    bucket.unwrap_or(DEFAULT_BUCKET)
}

/// Hash buckets one entity instance has loaded or written
///
/// Reflects what this instance last read or wrote; writes from other
/// instances are not seen until the bucket is cleared.
#[derive(Debug, Default)]
pub struct EntityCache {
    loaded: HashMap<String, Attrs>,
    /// Whether the key was absent when this instance loaded it
    is_new: HashMap<String, bool>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn loaded(&self, bucket: Option<&str>) -> Option<&Attrs> {
        self.loaded.get(slot(bucket))
    }

    pub fn is_loaded(&self, bucket: Option<&str>) -> bool {
        self.loaded.contains_key(slot(bucket))
    }

    /// Absent-on-load flag; unknown buckets count as new
    pub fn is_new(&self, bucket: Option<&str>) -> bool {
        self.is_new.get(slot(bucket)).copied().unwrap_or(true)
    }

    pub fn insert(&mut self, bucket: Option<&str>, attrs: Attrs, is_new: bool) {
        let slot = slot(bucket).to_string();
        self.loaded.insert(slot.clone(), attrs);
        self.is_new.insert(slot, is_new);
    }

    /// Forget one bucket, leaving the others
    pub fn clear(&mut self, bucket: Option<&str>) {
        self.loaded.remove(slot(bucket));
        self.is_new.remove(slot(bucket));
    }

    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }
}
