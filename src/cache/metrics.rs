//! Cache counters.
//!
//! Counters are relaxed atomics; they are for observability and never feed
//! back into cache decisions.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) inserts: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) expirations: AtomicU64,
    pub(crate) invalidations: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64, by: usize) {
        counter.fetch_add(u64::try_from(by).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, entries: usize, memory_bytes: usize) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            entries,
            memory_bytes,
        }
    }
}

/// Point-in-time cache metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheMetrics {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that found nothing usable.
    pub misses: u64,
    /// Successful inserts.
    pub inserts: u64,
    /// Inserts refused (oversized or unencodable results).
    pub rejected: u64,
    /// Entries removed under capacity pressure.
    pub evictions: u64,
    /// Entries removed because their TTL ran out.
    pub expirations: u64,
    /// Entries removed by `invalidate` or registry changes.
    pub invalidations: u64,
    /// Entries currently held.
    pub entries: usize,
    /// Estimated memory footprint of all entries.
    pub memory_bytes: usize,
}

impl CacheMetrics {
    /// Hits over lookups (0.0 to 1.0; 0.0 before any lookup).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio() {
        assert!(CacheMetrics::default().hit_ratio().abs() < f64::EPSILON);

        let counters = Counters::default();
        Counters::bump(&counters.hits, 3);
        Counters::bump(&counters.misses, 1);
        let m = counters.snapshot(2, 128);
        assert!((m.hit_ratio() - 0.75).abs() < f64::EPSILON);
        assert_eq!(m.entries, 2);
        assert_eq!(m.memory_bytes, 128);
    }
}
