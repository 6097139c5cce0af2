use std::sync::atomic::{AtomicU64, Ordering};

/// Observability counters for the block cache, in the spirit of the
/// counters this crate keeps for its other caching layers.
#[derive(Default)]
pub struct CacheMetrics {
    pub segment_hits: AtomicU64,
    pub segment_misses: AtomicU64,
    pub segments_evicted: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub flushes: AtomicU64,
    pub merge_reads: AtomicU64,
}

impl CacheMetrics {
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            segment_hits: self.segment_hits.load(Ordering::Relaxed),
            segment_misses: self.segment_misses.load(Ordering::Relaxed),
            segments_evicted: self.segments_evicted.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            merge_reads: self.merge_reads.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheMetricsSnapshot {
    pub segment_hits: u64,
    pub segment_misses: u64,
    pub segments_evicted: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub flushes: u64,
    pub merge_reads: u64,
}
