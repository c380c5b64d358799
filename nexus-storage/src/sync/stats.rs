//! Counters for the sync service.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, updated from any task.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    /// Reads answered from the in-process view.
    pub local_hits: AtomicU64,
    /// Reads answered from the shared cache.
    pub shared_hits: AtomicU64,
    /// Reads that went to the durable store.
    pub store_reads: AtomicU64,
    /// Committed writes and deletes.
    pub writes: AtomicU64,
    /// Conditional writes rejected on revision.
    pub conflicts: AtomicU64,
    /// Cache steps skipped or failed because the cache was unreachable.
    pub degraded_ops: AtomicU64,
    /// Invalidations from other nodes that dropped or fenced a key.
    pub invalidations_applied: AtomicU64,
    /// Invalidations ignored as older than what this node already knew.
    pub stale_invalidations: AtomicU64,
    /// Broadcasts lost because the pending queue was full.
    pub dropped_broadcasts: AtomicU64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SyncStats {
        SyncStats {
            local_hits: self.local_hits.load(Ordering::Relaxed),
            shared_hits: self.shared_hits.load(Ordering::Relaxed),
            store_reads: self.store_reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            degraded_ops: self.degraded_ops.load(Ordering::Relaxed),
            invalidations_applied: self.invalidations_applied.load(Ordering::Relaxed),
            stale_invalidations: self.stale_invalidations.load(Ordering::Relaxed),
            dropped_broadcasts: self.dropped_broadcasts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SyncMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub local_hits: u64,
    pub shared_hits: u64,
    pub store_reads: u64,
    pub writes: u64,
    pub conflicts: u64,
    pub degraded_ops: u64,
    pub invalidations_applied: u64,
    pub stale_invalidations: u64,
    pub dropped_broadcasts: u64,
}

impl SyncStats {
    pub fn total_reads(&self) -> u64 {
        self.local_hits + self.shared_hits + self.store_reads
    }

    /// Share of reads served without the store (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.total_reads();
        if total == 0 {
            0.0
        } else {
            (self.local_hits + self.shared_hits) as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate_empty() {
        assert_eq!(SyncStats::default().hit_rate(), 0.0);
    }

    #[test]
    fn test_hit_rate_counts_both_cache_layers() {
        let metrics = SyncMetrics::new();
        SyncMetrics::bump(&metrics.local_hits);
        SyncMetrics::bump(&metrics.shared_hits);
        SyncMetrics::bump(&metrics.store_reads);
        SyncMetrics::bump(&metrics.store_reads);
        let stats = metrics.snapshot();
        assert_eq!(stats.total_reads(), 4);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }
}
