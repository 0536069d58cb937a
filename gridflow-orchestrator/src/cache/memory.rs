//! Cache storage backends.
//!
//! [`CacheBackend`] is the seam for sharing cache state between processes
//! (a key-value store with get/set/delete). [`MemoryBackend`] is the bounded
//! in-process default: an LRU map plus a per-resource index so writes can find
//! the entries they overlap without scanning.

use async_trait::async_trait;
use gridflow_core::{Fingerprint, Payload, Target};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// A cached read result
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub resource_id: String,
    pub target: Target,
    pub value: Payload,
    pub inserted_at: Instant,
    pub ttl: Duration,
    pub validator: Option<String>,
}

impl CacheEntry {
    /// Fresh while `now < inserted_at + ttl`.
    pub fn is_fresh(&self, now: Instant) -> bool {
        now < self.inserted_at + self.ttl
    }

    /// Still worth a conditional revalidation.
    pub fn is_revalidatable(&self, now: Instant, retention: Duration) -> bool {
        self.validator.is_some() && now < self.inserted_at + self.ttl + retention
    }
}

/// Storage behind [`ReadCache`](super::ReadCache).
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, fingerprint: Fingerprint) -> Option<CacheEntry>;

    /// Insert or replace an entry; returns how many other entries were evicted.
    async fn put(&self, entry: CacheEntry) -> usize;

    async fn remove(&self, fingerprint: Fingerprint) -> bool;

    /// Remove every entry of `resource_id` whose target overlaps `target`.
    async fn remove_overlapping(&self, resource_id: &str, target: &Target) -> usize;

    async fn len(&self) -> usize;

    async fn clear(&self);
}

struct MemoryInner {
    entries: LruCache<Fingerprint, CacheEntry>,
    by_resource: HashMap<String, HashSet<Fingerprint>>,
}

impl MemoryInner {
    fn unindex(&mut self, resource_id: &str, fingerprint: &Fingerprint) {
        if let Some(set) = self.by_resource.get_mut(resource_id) {
            set.remove(fingerprint);
            if set.is_empty() {
                self.by_resource.remove(resource_id);
            }
        }
    }
}

/// Bounded in-process backend with LRU eviction
pub struct MemoryBackend {
    inner: Mutex<MemoryInner>,
}

impl MemoryBackend {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(MemoryInner {
                entries: LruCache::new(capacity),
                by_resource: HashMap::new(),
            }),
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, fingerprint: Fingerprint) -> Option<CacheEntry> {
        self.inner.lock().entries.get(&fingerprint).cloned()
    }

    async fn put(&self, entry: CacheEntry) -> usize {
        let mut inner = self.inner.lock();
        let fingerprint = entry.fingerprint;
        inner
            .by_resource
            .entry(entry.resource_id.clone())
            .or_default()
            .insert(fingerprint);

        match inner.entries.push(fingerprint, entry) {
            Some((evicted_fp, evicted)) if evicted_fp != fingerprint => {
                inner.unindex(&evicted.resource_id, &evicted_fp);
                1
            }
            _ => 0,
        }
    }

    async fn remove(&self, fingerprint: Fingerprint) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.pop(&fingerprint) {
            Some(entry) => {
                inner.unindex(&entry.resource_id, &fingerprint);
                true
            }
            None => false,
        }
    }

    async fn remove_overlapping(&self, resource_id: &str, target: &Target) -> usize {
        let mut inner = self.inner.lock();
        let Some(candidates) = inner.by_resource.get(resource_id).cloned() else {
            return 0;
        };

        let mut removed = 0;
        for fingerprint in candidates {
            let overlaps = inner
                .entries
                .peek(&fingerprint)
                .map(|entry| entry.target.overlaps(target))
                .unwrap_or(true);
            if overlaps {
                if inner.entries.pop(&fingerprint).is_some() {
                    removed += 1;
                }
                inner.unindex(resource_id, &fingerprint);
            }
        }
        removed
    }

    async fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    async fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.by_resource.clear();
    }
}
