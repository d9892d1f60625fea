// # Cache Statistics
//
// Lock-free counters for cache effectiveness monitoring. Recording is a
// relaxed atomic increment on the hot path; snapshots are eventually
// consistent.

use crate::common::RemovalCause;
use std::sync::atomic::{AtomicU64, Ordering};

/// Concurrent statistics recorder.
#[derive(Debug, Default)]
pub struct CacheStatistics {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    eviction_weight: AtomicU64,
}

impl CacheStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_eviction(&self, weight: u32, cause: RemovalCause) {
        debug_assert!(cause.was_evicted());
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.eviction_weight
            .fetch_add(u64::from(weight), Ordering::Relaxed);
    }

    /// Consistent-enough snapshot of the counters.
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            eviction_weight: self.eviction_weight.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub eviction_weight: u64,
}

impl CacheStats {
    #[inline]
    pub fn request_count(&self) -> u64 {
        self.hits + self.misses
    }

    pub fn hit_rate(&self) -> f64 {
        let requests = self.request_count();
        if requests == 0 {
            1.0
        } else {
            self.hits as f64 / requests as f64
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = CacheStatistics::new();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        stats.record_eviction(3, RemovalCause::Size);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.evictions, 1);
        assert_eq!(snapshot.eviction_weight, 3);
        assert_eq!(snapshot.request_count(), 3);
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStatistics::new();
        assert_eq!(stats.snapshot().hit_rate(), 1.0);

        stats.record_hit();
        stats.record_miss();
        let rate = stats.snapshot().hit_rate();
        assert!((rate - 0.5).abs() < f64::EPSILON);
    }
}
