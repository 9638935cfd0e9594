//! Memory accounting
//!
//! Per-type byte counters fed by every keyspace mutation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::ObjectType;

/// Live per-type memory counters
///
/// ## Concurrency:
/// - One atomic per type tag, updated lock-free from any shard
/// - The aggregate is never stored; it is summed from the per-type values
///   on every read, so it cannot drift from them
pub struct MemoryAccounting {
    by_type: [AtomicU64; ObjectType::COUNT],
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryCounters {
    /// Bytes per type tag (every tag present, zero included)
    pub by_type: BTreeMap<ObjectType, u64>,

    /// Sum of all per-type counts
    pub total: u64,
}

impl MemoryCounters {
    /// Bytes charged to one type
    pub fn get(&self, object_type: ObjectType) -> u64 {
        self.by_type.get(&object_type).copied().unwrap_or(0)
    }

    /// Types with a non-zero count, in counter order
    pub fn non_zero(&self) -> impl Iterator<Item = (ObjectType, u64)> + '_ {
        self.by_type
            .iter()
            .filter(|(_, bytes)| **bytes > 0)
            .map(|(t, bytes)| (*t, *bytes))
    }
}

impl MemoryAccounting {
    /// Create a zeroed set of counters
    pub fn new() -> Self {
        Self {
            by_type: Default::default(),
        }
    }

    /// Charge `size` bytes to `object_type`
    pub fn on_insert(&self, object_type: ObjectType, size: u64) {
        if size == 0 {
            return;
        }
        self.by_type[object_type as usize].fetch_add(size, Ordering::Relaxed);
    }

    /// Release `size` bytes from `object_type`
    ///
    /// Saturates at zero. An underflow means a caller released more than it
    /// charged and is logged rather than wrapping.
    pub fn on_remove(&self, object_type: ObjectType, size: u64) {
        if size == 0 {
            return;
        }
        let counter = &self.by_type[object_type as usize];
        let result = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
            Some(current.saturating_sub(size))
        });
        if let Ok(previous) = result {
            if previous < size {
                tracing::warn!(
                    object_type = %object_type,
                    previous,
                    size,
                    "Memory counter underflow, clamped to zero"
                );
            }
        }
    }

    /// Adjust a counter from `before` bytes to `after` bytes
    pub fn on_resize(&self, object_type: ObjectType, before: u64, after: u64) {
        if after > before {
            self.on_insert(object_type, after - before);
        } else {
            self.on_remove(object_type, before - after);
        }
    }

    /// Read all counters
    pub fn snapshot_counters(&self) -> MemoryCounters {
        let mut by_type = BTreeMap::new();
        let mut total = 0;
        for object_type in ObjectType::ALL {
            let bytes = self.by_type[object_type as usize].load(Ordering::Relaxed);
            total += bytes;
            by_type.insert(object_type, bytes);
        }
        MemoryCounters { by_type, total }
    }

    /// Aggregate bytes across all types
    pub fn total(&self) -> u64 {
        self.snapshot_counters().total
    }
}

impl Default for MemoryAccounting {
    fn default() -> Self {
        Self::new()
    }
}
