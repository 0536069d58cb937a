//! Read cache with TTL, validator revalidation and write invalidation.
//!
//! # Architecture
//!
//! ```text
//! read lookup
//!      │
//!      ▼
//! ┌──────────────┐  fresh (now < inserted + ttl)
//! │  ReadCache   │ ────────────────────────────▶ serve
//! │              │  expired, has validator
//! │              │ ────────────────────────────▶ conditional fetch
//! └──────┬───────┘  otherwise
//!        │ miss
//!        ▼
//!   upstream fetch ──▶ put_if_epoch (skipped if a write intervened)
//!
//! write ──▶ invalidate(resource, target): bump epoch, drop overlapping entries
//! ```
//!
//! Every invalidation advances the resource's epoch. Fetches remember the
//! epoch they started under and their result is only stored if no
//! invalidation happened since, so a slow read can never re-insert data older
//! than a completed write.

mod config;
mod memory;
mod metrics;

pub use config::CacheConfig;
pub use memory::{CacheBackend, CacheEntry, MemoryBackend};
pub use metrics::{CacheMetrics, CacheStats};

use gridflow_core::{Operation, Payload, Target};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::debug;

use crate::metrics::prometheus as prom;

/// Resources whose epoch is tracked individually.
const MAX_TRACKED_RESOURCES: usize = 4096;

/// Cache epoch of a resource at some point in time.
pub type Epoch = u64;

/// What a lookup found
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Fresh(Payload),
    /// Expired but revalidatable: fetch conditionally with `validator`
    Revalidate { validator: String, payload: Payload },
    Miss,
}

struct EpochTable {
    current: LruCache<String, Epoch>,
    /// Lower bound for resources whose epoch was evicted
    floor: Epoch,
    counter: Epoch,
}

impl EpochTable {
    fn get(&self, resource_id: &str) -> Epoch {
        self.current.peek(resource_id).copied().unwrap_or(self.floor)
    }

    fn bump(&mut self, resource_id: &str) -> Epoch {
        self.counter += 1;
        let epoch = self.counter;
        if let Some((evicted, old)) = self.current.push(resource_id.to_string(), epoch) {
            if evicted != resource_id {
                self.floor = self.floor.max(old);
            }
        }
        epoch
    }
}

/// Read cache front end
pub struct ReadCache {
    config: CacheConfig,
    backend: Arc<dyn CacheBackend>,
    epochs: Mutex<EpochTable>,
    metrics: CacheMetrics,
}

impl ReadCache {
    /// Cache over the bounded in-memory backend.
    pub fn new(config: CacheConfig) -> Self {
        let backend = Arc::new(MemoryBackend::new(config.max_entries));
        Self::with_backend(config, backend)
    }

    pub fn with_backend(config: CacheConfig, backend: Arc<dyn CacheBackend>) -> Self {
        let capacity = NonZeroUsize::new(MAX_TRACKED_RESOURCES).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            backend,
            epochs: Mutex::new(EpochTable { current: LruCache::new(capacity), floor: 0, counter: 0 }),
            metrics: CacheMetrics::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up a read operation.
    pub async fn lookup(&self, op: &Operation) -> Lookup {
        let fingerprint = op.fingerprint();
        let Some(entry) = self.backend.get(fingerprint).await else {
            self.metrics.record_miss();
            return Lookup::Miss;
        };

        let now = Instant::now();
        if entry.is_fresh(now) {
            self.metrics.record_hit();
            debug!(fingerprint = %fingerprint, "Cache hit");
            return Lookup::Fresh(entry.value);
        }

        if entry.is_revalidatable(now, self.config.stale_retention()) {
            if let Some(validator) = entry.validator {
                self.metrics.record_revalidation();
                return Lookup::Revalidate { validator, payload: entry.value };
            }
        }

        self.backend.remove(fingerprint).await;
        self.metrics.record_expiration();
        self.metrics.record_miss();
        Lookup::Miss
    }

    /// Fresh value for `op`, if any, without touching the hit/miss counters
    /// or expiring the entry.
    pub async fn peek_fresh(&self, op: &Operation) -> Option<Payload> {
        self.backend
            .get(op.fingerprint())
            .await
            .filter(|entry| entry.is_fresh(Instant::now()))
            .map(|entry| entry.value)
    }

    /// Current epoch of a resource; capture before fetching.
    pub async fn epoch(&self, resource_id: &str) -> Epoch {
        self.epochs.lock().await.get(resource_id)
    }

    /// Store a fetched result unless the resource was invalidated since `epoch`.
    pub async fn put_if_epoch(
        &self,
        op: &Operation,
        epoch: Epoch,
        value: Payload,
        validator: Option<String>,
    ) -> bool {
        let epochs = self.epochs.lock().await;
        if epochs.get(op.resource_id()) != epoch {
            self.metrics.record_stale_fill();
            debug!(fingerprint = %op.fingerprint(), "Skipping stale cache fill");
            return false;
        }

        let evicted = self
            .backend
            .put(CacheEntry {
                fingerprint: op.fingerprint(),
                resource_id: op.resource_id().to_string(),
                target: op.target().clone(),
                value,
                inserted_at: Instant::now(),
                ttl: self.config.ttl(),
                validator,
            })
            .await;
        drop(epochs);

        self.metrics.record_put();
        if evicted > 0 {
            self.metrics.record_evictions(evicted);
        }
        prom::set_cache_entries(self.backend.len().await);
        true
    }

    /// Refresh an entry after the upstream confirmed it is unchanged.
    pub async fn refresh(
        &self,
        op: &Operation,
        epoch: Epoch,
        value: Payload,
        validator: String,
    ) -> bool {
        let stored = self.put_if_epoch(op, epoch, value, Some(validator)).await;
        if stored {
            self.metrics.record_revalidated();
        }
        stored
    }

    /// Drop every entry overlapping a write and advance the resource epoch.
    pub async fn invalidate(&self, resource_id: &str, target: &Target) -> usize {
        let mut epochs = self.epochs.lock().await;
        let epoch = epochs.bump(resource_id);
        let removed = self.backend.remove_overlapping(resource_id, target).await;
        drop(epochs);

        if removed > 0 {
            self.metrics.record_invalidations(removed);
        }
        debug!(resource = resource_id, target = %target, epoch, removed, "Cache invalidated");
        removed
    }

    pub async fn clear(&self) {
        self.backend.clear().await;
        prom::set_cache_entries(0);
    }

    pub async fn stats(&self) -> CacheStats {
        self.metrics.snapshot(self.backend.len().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflow_core::GridRange;
    use serde_json::json;
    use std::time::Duration;

    fn config(ttl_ms: u64) -> CacheConfig {
        CacheConfig { max_entries: 100, ttl_ms, stale_retention_ms: 60_000 }
    }

    fn read(start: u32, end: u32) -> Operation {
        Operation::read("doc", GridRange::rows("S", start, end))
    }

    fn value(n: i64) -> Payload {
        Payload::Values(vec![vec![json!(n)]])
    }

    #[tokio::test]
    async fn test_put_and_hit() {
        let cache = ReadCache::new(config(60_000));
        let op = read(0, 10);
        let epoch = cache.epoch("doc").await;

        assert_eq!(cache.lookup(&op).await, Lookup::Miss);
        assert!(cache.put_if_epoch(&op, epoch, value(1), None).await);
        assert_eq!(cache.lookup(&op).await, Lookup::Fresh(value(1)));
    }

    #[tokio::test]
    async fn test_peek_fresh_leaves_counters_alone() {
        let cache = ReadCache::new(config(60_000));
        let op = read(0, 10);
        assert_eq!(cache.peek_fresh(&op).await, None);

        let epoch = cache.epoch("doc").await;
        cache.put_if_epoch(&op, epoch, value(1), None).await;
        assert_eq!(cache.peek_fresh(&op).await, Some(value(1)));

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = ReadCache::new(config(20));
        let op = read(0, 10);
        let epoch = cache.epoch("doc").await;
        cache.put_if_epoch(&op, epoch, value(1), None).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.lookup(&op).await, Lookup::Miss);
        assert_eq!(cache.stats().await.expirations, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_with_validator_revalidates() {
        let cache = ReadCache::new(config(20));
        let op = read(0, 10);
        let epoch = cache.epoch("doc").await;
        cache.put_if_epoch(&op, epoch, value(1), Some("rev-3".into())).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            cache.lookup(&op).await,
            Lookup::Revalidate { validator: "rev-3".into(), payload: value(1) }
        );

        assert!(cache.refresh(&op, epoch, value(1), "rev-3".into()).await);
        assert_eq!(cache.lookup(&op).await, Lookup::Fresh(value(1)));
    }

    #[tokio::test]
    async fn test_invalidate_overlapping_only() {
        let cache = ReadCache::new(config(60_000));
        let a = read(0, 10);
        let b = read(20, 30);
        let epoch = cache.epoch("doc").await;
        cache.put_if_epoch(&a, epoch, value(1), None).await;
        cache.put_if_epoch(&b, epoch, value(2), None).await;

        let removed = cache.invalidate("doc", &GridRange::rows("S", 5, 6).into()).await;
        assert_eq!(removed, 1);
        assert_eq!(cache.lookup(&a).await, Lookup::Miss);
        assert_eq!(cache.lookup(&b).await, Lookup::Fresh(value(2)));
    }

    #[tokio::test]
    async fn test_fill_after_invalidation_is_skipped() {
        let cache = ReadCache::new(config(60_000));
        let op = read(0, 10);
        let before = cache.epoch("doc").await;

        cache.invalidate("doc", &Target::Whole).await;
        assert!(!cache.put_if_epoch(&op, before, value(0), None).await);
        assert_eq!(cache.lookup(&op).await, Lookup::Miss);

        // Other resources are unaffected
        let other = Operation::read("other", GridRange::rows("S", 0, 1));
        let epoch = cache.epoch("other").await;
        assert!(cache.put_if_epoch(&other, epoch, value(0), None).await);
    }

    #[test]
    fn test_epoch_floor_survives_eviction() {
        let mut table = EpochTable {
            current: LruCache::new(NonZeroUsize::new(1).unwrap()),
            floor: 0,
            counter: 0,
        };
        let a = table.bump("a");
        table.bump("b");
        // "a" was evicted; its epoch must not go backwards
        assert!(table.get("a") >= a);
    }
}
