use std::sync::atomic::{AtomicU64, Ordering};

/// Storage engine counters, shared via `Arc` with every component that
/// reports into them. All counters are monotonic.
#[derive(Debug, Default)]
pub struct Metrics {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    bloom_skips: AtomicU64,
    index_searches: AtomicU64,
    index_depth_total: AtomicU64,
    flushes: AtomicU64,
    compactions: AtomicU64,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub bloom_skips: u64,
    pub index_searches: u64,
    pub index_depth_total: u64,
    pub flushes: u64,
    pub compactions: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn bloom_skip(&self) {
        self.bloom_skips.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one index lookup and the number of blocks it visited.
    pub(crate) fn index_search(&self, depth: u64) {
        self.index_searches.fetch_add(1, Ordering::Relaxed);
        self.index_depth_total.fetch_add(depth, Ordering::Relaxed);
    }

    pub(crate) fn flush_completed(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn compaction_completed(&self) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            bloom_skips: self.bloom_skips.load(Ordering::Relaxed),
            index_searches: self.index_searches.load(Ordering::Relaxed),
            index_depth_total: self.index_depth_total.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
        }
    }
}
