//! Configuration for the read cache.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the read cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries before LRU eviction
    pub max_entries: usize,

    /// Time-to-live for entries; a hit is served only while `now < inserted + ttl`
    pub ttl_ms: u64,

    /// How long an expired entry that carries a validator is kept for
    /// conditional revalidation
    pub stale_retention_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 5000,
            ttl_ms: 60_000,              // 1 minute
            stale_retention_ms: 300_000, // 5 minutes
        }
    }
}

impl CacheConfig {
    /// Small cache with short TTL for interactive sessions
    pub fn low_latency() -> Self {
        Self { max_entries: 1000, ttl_ms: 15_000, stale_retention_ms: 60_000 }
    }

    /// Large cache for bulk workloads
    pub fn high_throughput() -> Self {
        Self { max_entries: 20_000, ttl_ms: 120_000, stale_retention_ms: 600_000 }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn stale_retention(&self) -> Duration {
        Duration::from_millis(self.stale_retention_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.max_entries, 5000);
        assert_eq!(config.ttl(), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: CacheConfig = serde_json::from_str(r#"{"ttl_ms": 500}"#).unwrap();
        assert_eq!(config.ttl_ms, 500);
        assert_eq!(config.max_entries, 5000);
    }
}
