use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters of a [`crate::CoalescingCache`]
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evictions(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Record and report statistics for a cache tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Lookups answered from a resolved entry, including tombstones
    pub hits: u64,
    /// Lookups that started a fetch
    pub misses: u64,
    /// Lookups that joined a fetch already in flight
    pub coalesced: u64,
    /// Entries removed to stay within the capacity bound
    pub evictions: u64,
}

impl CacheStats {
    /// Total number of fetching lookups
    #[must_use]
    pub const fn lookups(&self) -> u64 {
        self.hits + self.misses + self.coalesced
    }

    /// Get cache hit rate (0.0 to 1.0).
    /// Coalesced lookups count as hits, since they caused no upstream request.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.lookups();
        if total == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let hit_rate = (self.hits + self.coalesced) as f64 / total as f64;
            hit_rate
        }
    }

    /// Get human-readable summary of the stats
    #[must_use]
    pub fn summary(&self) -> String {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let hit_pct = (self.hit_rate() * 100.0) as u64;
        format!(
            "{} lookups ({}% hits, {} coalesced), {} evictions",
            self.lookups(),
            hit_pct,
            self.coalesced,
            self.evictions
        )
    }
}
