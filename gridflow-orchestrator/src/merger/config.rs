//! Configuration for the read merger.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the read merger
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergerConfig {
    /// Disable to send every cache-missing read on its own
    pub enabled: bool,

    /// How long a group collects members before it is fetched
    pub window_ms: u64,

    /// A group is fetched as soon as it has this many members
    pub max_members: usize,

    /// Largest row/column gap bridged between a group and a new range.
    /// 0 merges only overlapping or touching ranges.
    pub max_gap: u32,

    /// A range joins only if the new cover is at most this many times the
    /// cells actually requested (cover + range)
    pub max_cover_ratio: f64,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 25,
            max_members: 64,
            max_gap: 0,
            max_cover_ratio: 2.0,
        }
    }
}

impl MergerConfig {
    /// Flush quickly, only merge ranges that overlap
    pub fn low_latency() -> Self {
        Self {
            enabled: true,
            window_ms: 5,
            max_members: 16,
            max_gap: 0,
            max_cover_ratio: 1.5,
        }
    }

    /// Wait longer and bridge small gaps to save upstream calls
    pub fn high_throughput() -> Self {
        Self {
            enabled: true,
            window_ms: 50,
            max_members: 256,
            max_gap: 5,
            max_cover_ratio: 3.0,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}
