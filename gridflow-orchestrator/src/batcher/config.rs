//! Configuration for the write batcher.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the write batcher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    /// Maximum age of an open window before it is flushed
    pub window_ms: u64,

    /// A window is flushed as soon as it holds this many writes
    pub max_size: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self { window_ms: 25, max_size: 50 }
    }
}

impl BatcherConfig {
    /// Flush almost immediately (interactive use)
    pub fn low_latency() -> Self {
        Self { window_ms: 5, max_size: 10 }
    }

    /// Accumulate larger batches for bulk edits
    pub fn high_throughput() -> Self {
        Self { window_ms: 100, max_size: 200 }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}
