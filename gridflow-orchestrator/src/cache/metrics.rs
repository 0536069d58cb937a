//! Metrics for the read cache.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::metrics::prometheus as prom;

/// Metrics for monitoring cache performance
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Fresh hits served without an upstream call
    pub hits: AtomicU64,
    /// Lookups that found nothing usable
    pub misses: AtomicU64,
    /// Lookups that found an expired entry with a validator
    pub revalidations: AtomicU64,
    /// Revalidations answered with "not modified"
    pub revalidated: AtomicU64,
    /// Total cache puts
    pub puts: AtomicU64,
    /// Fills skipped because an overlapping write happened during the fetch
    pub stale_fills_skipped: AtomicU64,
    /// Entries evicted by LRU pressure
    pub evictions: AtomicU64,
    /// Entries removed by overlapping writes
    pub invalidations: AtomicU64,
    /// Entries dropped after TTL (plus retention)
    pub expirations: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        prom::record_cache_lookup("hit");
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        prom::record_cache_lookup("miss");
    }

    pub fn record_revalidation(&self) {
        self.revalidations.fetch_add(1, Ordering::Relaxed);
        prom::record_cache_lookup("revalidate");
    }

    pub fn record_revalidated(&self) {
        self.revalidated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_fill(&self) {
        self.stale_fills_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, n: usize) {
        self.evictions.fetch_add(n as u64, Ordering::Relaxed);
        prom::CACHE_EVICTIONS_TOTAL.inc_by(n as f64);
    }

    pub fn record_invalidations(&self, n: usize) {
        self.invalidations.fetch_add(n as u64, Ordering::Relaxed);
        prom::CACHE_INVALIDATIONS_TOTAL.inc_by(n as f64);
    }

    pub fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self, entries: usize) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let revalidations = self.revalidations.load(Ordering::Relaxed);
        let lookups = hits + misses + revalidations;

        CacheStats {
            entries,
            hits,
            misses,
            revalidations,
            revalidated: self.revalidated.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            stale_fills_skipped: self.stale_fills_skipped.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            hit_rate: if lookups > 0 { hits as f64 / lookups as f64 } else { 0.0 },
        }
    }
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub revalidations: u64,
    pub revalidated: u64,
    pub puts: u64,
    pub stale_fills_skipped: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub expirations: u64,
    /// Fresh hits over all lookups
    pub hit_rate: f64,
}
