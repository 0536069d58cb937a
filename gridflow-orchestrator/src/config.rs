//! Orchestrator configuration.
//!
//! One struct composed of the per-component configs. Loaded from a JSON file,
//! from `GRIDFLOW_*` environment variables, or built from a preset.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::batcher::BatcherConfig;
use crate::cache::CacheConfig;
use crate::coordinator::CoordinatorConfig;
use crate::executor::ExecutorConfig;
use crate::merger::MergerConfig;
use crate::prefetch::PrefetchConfig;
use crate::resilience::{CircuitConfig, RateLimitConfig};

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} is out of range: {reason}")]
    OutOfRange { field: &'static str, reason: String },
}

/// Complete orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub coordinator: CoordinatorConfig,
    pub rate_limit: RateLimitConfig,
    pub circuit: CircuitConfig,
    pub cache: CacheConfig,
    pub merger: MergerConfig,
    pub batcher: BatcherConfig,
    pub executor: ExecutorConfig,
    pub prefetch: PrefetchConfig,
    /// Unresolved operations allowed at once; beyond this `submit` fails fast
    pub max_pending_operations: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorConfig::default(),
            rate_limit: RateLimitConfig::default(),
            circuit: CircuitConfig::default(),
            cache: CacheConfig::default(),
            merger: MergerConfig::default(),
            batcher: BatcherConfig::default(),
            executor: ExecutorConfig::default(),
            prefetch: PrefetchConfig::default(),
            max_pending_operations: 10_000,
        }
    }
}

impl OrchestratorConfig {
    /// Short windows, little speculation (interactive single user)
    pub fn low_latency() -> Self {
        Self {
            coordinator: CoordinatorConfig { max_concurrent: 4 },
            cache: CacheConfig::low_latency(),
            merger: MergerConfig::low_latency(),
            batcher: BatcherConfig::low_latency(),
            executor: ExecutorConfig { max_attempts: 3, attempt_timeout_ms: 10_000, ..Default::default() },
            prefetch: PrefetchConfig::low_latency(),
            ..Default::default()
        }
    }

    /// Larger windows and more parallelism (bulk workloads)
    pub fn high_throughput() -> Self {
        Self {
            coordinator: CoordinatorConfig { max_concurrent: 20 },
            cache: CacheConfig::high_throughput(),
            merger: MergerConfig::high_throughput(),
            batcher: BatcherConfig::high_throughput(),
            executor: ExecutorConfig { max_parallel: 16, ..Default::default() },
            prefetch: PrefetchConfig::high_throughput(),
            max_pending_operations: 50_000,
            ..Default::default()
        }
    }

    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Defaults overridden by `GRIDFLOW_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup. Every knob read from the
    /// environment is listed here.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &'static str,
            slot: &mut T,
        ) -> Result<(), ConfigError> {
            if let Some(value) = lookup(key) {
                *slot = value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidEnv { key, value: value.clone() })?;
            }
            Ok(())
        }

        fn parse_bool(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &'static str,
            slot: &mut bool,
        ) -> Result<(), ConfigError> {
            if let Some(value) = lookup(key) {
                let normalized = value.trim().to_lowercase();
                *slot = match normalized.as_str() {
                    "1" | "true" | "yes" | "on" => true,
                    "0" | "false" | "no" | "off" => false,
                    _ => return Err(ConfigError::InvalidEnv { key, value }),
                };
            }
            Ok(())
        }

        parse(&lookup, "GRIDFLOW_MAX_CONCURRENT", &mut self.coordinator.max_concurrent)?;
        parse(&lookup, "GRIDFLOW_RATE_LIMIT", &mut self.rate_limit.limit)?;
        parse(&lookup, "GRIDFLOW_RATE_WINDOW_MS", &mut self.rate_limit.window_ms)?;
        parse(&lookup, "GRIDFLOW_RATE_MAX_WAITING", &mut self.rate_limit.max_waiting)?;
        parse(&lookup, "GRIDFLOW_CIRCUIT_THRESHOLD", &mut self.circuit.failure_threshold)?;
        parse(&lookup, "GRIDFLOW_CIRCUIT_COOLDOWN_MS", &mut self.circuit.cooldown_ms)?;
        parse(&lookup, "GRIDFLOW_CIRCUIT_MAX_COOLDOWN_MS", &mut self.circuit.max_cooldown_ms)?;
        parse(&lookup, "GRIDFLOW_CACHE_MAX_ENTRIES", &mut self.cache.max_entries)?;
        parse(&lookup, "GRIDFLOW_CACHE_TTL_MS", &mut self.cache.ttl_ms)?;
        parse_bool(&lookup, "GRIDFLOW_MERGE_ENABLED", &mut self.merger.enabled)?;
        parse(&lookup, "GRIDFLOW_MERGE_WINDOW_MS", &mut self.merger.window_ms)?;
        parse(&lookup, "GRIDFLOW_MERGE_MAX_GAP", &mut self.merger.max_gap)?;
        parse(&lookup, "GRIDFLOW_BATCH_WINDOW_MS", &mut self.batcher.window_ms)?;
        parse(&lookup, "GRIDFLOW_BATCH_MAX_SIZE", &mut self.batcher.max_size)?;
        parse(&lookup, "GRIDFLOW_MAX_PARALLEL", &mut self.executor.max_parallel)?;
        parse(&lookup, "GRIDFLOW_MAX_ATTEMPTS", &mut self.executor.max_attempts)?;
        parse(&lookup, "GRIDFLOW_ATTEMPT_TIMEOUT_MS", &mut self.executor.attempt_timeout_ms)?;
        parse_bool(&lookup, "GRIDFLOW_PREFETCH_ENABLED", &mut self.prefetch.enabled)?;
        parse(&lookup, "GRIDFLOW_PREFETCH_CONFIDENCE", &mut self.prefetch.confidence_threshold)?;
        parse(&lookup, "GRIDFLOW_MAX_PENDING", &mut self.max_pending_operations)?;
        Ok(())
    }

    /// Reject values the components cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero: [(&'static str, u64); 13] = [
            ("coordinator.max_concurrent", self.coordinator.max_concurrent as u64),
            ("rate_limit.limit", self.rate_limit.limit as u64),
            ("rate_limit.window_ms", self.rate_limit.window_ms),
            ("circuit.failure_threshold", self.circuit.failure_threshold as u64),
            ("cache.max_entries", self.cache.max_entries as u64),
            ("cache.ttl_ms", self.cache.ttl_ms),
            ("merger.max_members", self.merger.max_members as u64),
            ("batcher.max_size", self.batcher.max_size as u64),
            ("executor.max_parallel", self.executor.max_parallel as u64),
            ("executor.max_attempts", self.executor.max_attempts as u64),
            ("executor.attempt_timeout_ms", self.executor.attempt_timeout_ms),
            ("prefetch.max_inflight", self.prefetch.max_inflight as u64),
            ("max_pending_operations", self.max_pending_operations as u64),
        ];
        if let Some((field, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero { field });
        }

        if self.circuit.max_cooldown_ms < self.circuit.cooldown_ms {
            return Err(ConfigError::OutOfRange {
                field: "circuit.max_cooldown_ms",
                reason: "must not be below circuit.cooldown_ms".to_string(),
            });
        }
        if self.executor.max_backoff_ms < self.executor.base_backoff_ms {
            return Err(ConfigError::OutOfRange {
                field: "executor.max_backoff_ms",
                reason: "must not be below executor.base_backoff_ms".to_string(),
            });
        }
        if !(self.merger.max_cover_ratio >= 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "merger.max_cover_ratio",
                reason: format!("{} is below 1.0", self.merger.max_cover_ratio),
            });
        }
        if !(0.0..=1.0).contains(&self.prefetch.confidence_threshold) {
            return Err(ConfigError::OutOfRange {
                field: "prefetch.confidence_threshold",
                reason: format!("{} is outside 0.0..=1.0", self.prefetch.confidence_threshold),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.coordinator.max_concurrent, 10);
        assert_eq!(config.rate_limit.limit, 300);
        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(config.cache.max_entries, 5000);
        assert_eq!(config.batcher.max_size, 50);
        assert_eq!(config.max_pending_operations, 10_000);
        config.validate().unwrap();
        OrchestratorConfig::low_latency().validate().unwrap();
        OrchestratorConfig::high_throughput().validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let mut config = OrchestratorConfig::default();
        config
            .apply_env(env(&[
                ("GRIDFLOW_MAX_CONCURRENT", "3"),
                ("GRIDFLOW_BATCH_WINDOW_MS", "40"),
                ("GRIDFLOW_PREFETCH_ENABLED", "false"),
                ("GRIDFLOW_PREFETCH_CONFIDENCE", "0.75"),
            ]))
            .unwrap();
        assert_eq!(config.coordinator.max_concurrent, 3);
        assert_eq!(config.batcher.window_ms, 40);
        assert!(!config.prefetch.enabled);
        assert!((config.prefetch.confidence_threshold - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_bad_env_value_is_reported() {
        let mut config = OrchestratorConfig::default();
        let err = config.apply_env(env(&[("GRIDFLOW_CACHE_TTL_MS", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { key: "GRIDFLOW_CACHE_TTL_MS", .. }));
    }

    #[test]
    fn test_validate_rejects_zero() {
        let mut config = OrchestratorConfig::default();
        config.batcher.max_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Zero { field: "batcher.max_size" })));
    }

    #[test]
    fn test_validate_rejects_bad_ranges() {
        let mut config = OrchestratorConfig::default();
        config.prefetch.confidence_threshold = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::OutOfRange { .. })));

        let mut config = OrchestratorConfig::default();
        config.merger.max_cover_ratio = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{"batcher": {"max_size": 7}, "max_pending_operations": 12}"#).unwrap();
        assert_eq!(config.batcher.max_size, 7);
        assert_eq!(config.batcher.window_ms, 25);
        assert_eq!(config.max_pending_operations, 12);
        assert_eq!(config.coordinator.max_concurrent, 10);
    }
}
