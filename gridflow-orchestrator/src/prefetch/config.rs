//! Configuration for access-pattern prefetch.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the prefetch system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Enable prefetch (default: true)
    pub enabled: bool,

    /// Minimum confidence for a prediction to be queued (default: 0.6)
    pub confidence_threshold: f64,

    /// Access events kept per resource (default: 32)
    pub history_size: usize,

    /// Access events older than this are forgotten, in ms (default: 10 minutes)
    pub history_age_ms: u64,

    /// Maximum pending prefetch candidates (default: 32)
    pub max_queue: usize,

    /// Prefetches submitted at once (default: 2)
    pub max_inflight: usize,

    /// How many strides ahead to predict (default: 1)
    pub lookahead: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: 0.6,
            history_size: 32,
            history_age_ms: 600_000,
            max_queue: 32,
            max_inflight: 2,
            lookahead: 1,
        }
    }
}

impl PrefetchConfig {
    /// Only act on strong patterns and keep background load minimal
    pub fn low_latency() -> Self {
        Self {
            enabled: true,
            confidence_threshold: 0.8,
            history_size: 16,
            history_age_ms: 120_000,
            max_queue: 8,
            max_inflight: 1,
            lookahead: 1,
        }
    }

    /// Predict further ahead for sequential scans
    pub fn high_throughput() -> Self {
        Self {
            enabled: true,
            confidence_threshold: 0.5,
            history_size: 64,
            history_age_ms: 600_000,
            max_queue: 128,
            max_inflight: 4,
            lookahead: 3,
        }
    }

    pub fn history_age(&self) -> Duration {
        Duration::from_millis(self.history_age_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PrefetchConfig::default();
        assert!(config.enabled);
        assert!((config.confidence_threshold - 0.6).abs() < 1e-9);
        assert_eq!(config.history_size, 32);
        assert_eq!(config.history_age(), Duration::from_secs(600));
        assert_eq!(config.lookahead, 1);
    }

    #[test]
    fn test_presets() {
        assert!(PrefetchConfig::high_throughput().lookahead > PrefetchConfig::low_latency().lookahead);
    }
}
