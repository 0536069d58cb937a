//! Prometheus metrics for the gridflow orchestrator
//!
//! Fire-and-forget counters, gauges and histograms. Nothing in the
//! orchestration core reads these back; per-component atomic counters serve
//! `Orchestrator::stats()` instead.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    /// Global Prometheus registry for gridflow metrics
    pub static ref REGISTRY: Registry = Registry::new();

    // ============== Operation Metrics ==============

    /// Operations resolved, by kind and outcome label
    pub static ref OPERATIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("operations_total", "Total operations resolved")
            .namespace("gridflow"),
        &["kind", "status"]
    ).expect("metric can be created");

    /// Operations submitted but not yet resolved
    pub static ref PENDING_OPERATIONS: Gauge = Gauge::with_opts(
        Opts::new("pending_operations", "Operations submitted and not yet resolved")
            .namespace("gridflow")
    ).expect("metric can be created");

    // ============== Cache Metrics ==============

    /// Cache lookups by result (hit, miss, revalidate)
    pub static ref CACHE_LOOKUPS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("cache_lookups_total", "Total cache lookups")
            .namespace("gridflow"),
        &["result"]
    ).expect("metric can be created");

    /// Entries evicted by LRU pressure
    pub static ref CACHE_EVICTIONS_TOTAL: Counter = Counter::with_opts(
        Opts::new("cache_evictions_total", "Total cache evictions")
            .namespace("gridflow")
    ).expect("metric can be created");

    /// Entries removed by overlapping writes
    pub static ref CACHE_INVALIDATIONS_TOTAL: Counter = Counter::with_opts(
        Opts::new("cache_invalidations_total", "Total cache entries invalidated by writes")
            .namespace("gridflow")
    ).expect("metric can be created");

    /// Current number of cache entries
    pub static ref CACHE_ENTRIES: Gauge = Gauge::with_opts(
        Opts::new("cache_entries", "Current cache size (entries)")
            .namespace("gridflow")
    ).expect("metric can be created");

    // ============== Grouping Metrics ==============

    /// Identical reads that joined an in-flight request
    pub static ref DEDUP_JOINS_TOTAL: Counter = Counter::with_opts(
        Opts::new("dedup_joins_total", "Reads that joined an in-flight identical request")
            .namespace("gridflow")
    ).expect("metric can be created");

    /// Members per flushed merge group
    pub static ref MERGE_GROUP_SIZE: Histogram = Histogram::with_opts(
        HistogramOpts::new("merge_group_size", "Read operations per merged fetch")
            .namespace("gridflow")
            .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0])
    ).expect("metric can be created");

    /// Writes per flushed batch
    pub static ref BATCH_SIZE: Histogram = Histogram::with_opts(
        HistogramOpts::new("batch_size", "Write operations per flushed batch")
            .namespace("gridflow")
            .buckets(vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0])
    ).expect("metric can be created");

    /// Batch flushes by trigger (size, age, explicit, shutdown)
    pub static ref BATCH_FLUSHES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("batch_flushes_total", "Total batch window flushes")
            .namespace("gridflow"),
        &["trigger"]
    ).expect("metric can be created");

    // ============== Gating Metrics ==============

    /// Circuit state per endpoint (0 = closed, 1 = half-open, 2 = open)
    pub static ref CIRCUIT_STATE: GaugeVec = GaugeVec::new(
        Opts::new("circuit_state", "Circuit state (0=closed, 1=half_open, 2=open)")
            .namespace("gridflow"),
        &["endpoint"]
    ).expect("metric can be created");

    /// Circuit state transitions
    pub static ref CIRCUIT_TRANSITIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("circuit_transitions_total", "Total circuit state transitions")
            .namespace("gridflow"),
        &["endpoint", "to"]
    ).expect("metric can be created");

    /// Calls rejected by the rate limiter (waiting queue full)
    pub static ref RATE_LIMIT_REJECTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("rate_limit_rejections_total", "Total rate limiter rejections")
            .namespace("gridflow"),
        &["scope"]
    ).expect("metric can be created");

    /// Time spent waiting for rate limiter capacity
    pub static ref RATE_LIMIT_DELAY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("rate_limit_delay_seconds", "Time spent waiting on the rate limiter")
            .namespace("gridflow")
            .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0])
    ).expect("metric can be created");

    /// Coordinator waiters per priority tier
    pub static ref COORDINATOR_QUEUE_DEPTH: GaugeVec = GaugeVec::new(
        Opts::new("coordinator_queue_depth", "Operations waiting for a concurrency slot")
            .namespace("gridflow"),
        &["priority"]
    ).expect("metric can be created");

    /// Slots currently held
    pub static ref COORDINATOR_ACTIVE: Gauge = Gauge::with_opts(
        Opts::new("coordinator_active", "Concurrency slots currently held")
            .namespace("gridflow")
    ).expect("metric can be created");

    /// Time spent waiting for a concurrency slot
    pub static ref COORDINATOR_WAIT_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("coordinator_wait_seconds", "Time spent waiting for admission")
            .namespace("gridflow")
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0])
    ).expect("metric can be created");

    // ============== Upstream Metrics ==============

    /// Upstream call attempts by endpoint and outcome
    pub static ref UPSTREAM_CALLS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("upstream_calls_total", "Total upstream call attempts")
            .namespace("gridflow"),
        &["endpoint", "outcome"]
    ).expect("metric can be created");

    /// Retries scheduled by the executor
    pub static ref UPSTREAM_RETRIES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("upstream_retries_total", "Total upstream retries")
            .namespace("gridflow"),
        &["endpoint"]
    ).expect("metric can be created");

    /// Upstream attempt duration
    pub static ref UPSTREAM_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("upstream_duration_seconds", "Upstream attempt duration in seconds")
            .namespace("gridflow")
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["endpoint"]
    ).expect("metric can be created");

    // ============== Prefetch Metrics ==============

    /// Prefetch lifecycle events (queued, submitted, dropped, failed)
    pub static ref PREFETCH_TOTAL: CounterVec = CounterVec::new(
        Opts::new("prefetch_total", "Prefetch candidate events")
            .namespace("gridflow"),
        &["event"]
    ).expect("metric can be created");
}

/// Register all metrics with the global registry.
/// Should be called once at startup.
pub fn register_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(OPERATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PENDING_OPERATIONS.clone()))?;

    REGISTRY.register(Box::new(CACHE_LOOKUPS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CACHE_EVICTIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CACHE_INVALIDATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CACHE_ENTRIES.clone()))?;

    REGISTRY.register(Box::new(DEDUP_JOINS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MERGE_GROUP_SIZE.clone()))?;
    REGISTRY.register(Box::new(BATCH_SIZE.clone()))?;
    REGISTRY.register(Box::new(BATCH_FLUSHES_TOTAL.clone()))?;

    REGISTRY.register(Box::new(CIRCUIT_STATE.clone()))?;
    REGISTRY.register(Box::new(CIRCUIT_TRANSITIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RATE_LIMIT_REJECTIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RATE_LIMIT_DELAY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(COORDINATOR_QUEUE_DEPTH.clone()))?;
    REGISTRY.register(Box::new(COORDINATOR_ACTIVE.clone()))?;
    REGISTRY.register(Box::new(COORDINATOR_WAIT_SECONDS.clone()))?;

    REGISTRY.register(Box::new(UPSTREAM_CALLS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(UPSTREAM_RETRIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(UPSTREAM_DURATION_SECONDS.clone()))?;

    REGISTRY.register(Box::new(PREFETCH_TOTAL.clone()))?;

    Ok(())
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| format!("# Error encoding metrics: {}", e))
}

/// Record a resolved operation.
pub fn record_operation(kind: &str, status: &str) {
    OPERATIONS_TOTAL.with_label_values(&[kind, status]).inc();
}

/// Record a cache lookup result.
pub fn record_cache_lookup(result: &str) {
    CACHE_LOOKUPS_TOTAL.with_label_values(&[result]).inc();
}

/// Update cache size gauge.
pub fn set_cache_entries(size: usize) {
    CACHE_ENTRIES.set(size as f64);
}

/// Record a batch flush.
pub fn record_batch_flush(trigger: &str, size: usize) {
    BATCH_FLUSHES_TOTAL.with_label_values(&[trigger]).inc();
    BATCH_SIZE.observe(size as f64);
}

/// Record a circuit transition and update the state gauge.
pub fn record_circuit_transition(endpoint: &str, to: &str, gauge: f64) {
    CIRCUIT_TRANSITIONS_TOTAL.with_label_values(&[endpoint, to]).inc();
    CIRCUIT_STATE.with_label_values(&[endpoint]).set(gauge);
}

/// Update the coordinator queue gauge for one tier.
pub fn set_queue_depth(priority: &str, depth: usize) {
    COORDINATOR_QUEUE_DEPTH.with_label_values(&[priority]).set(depth as f64);
}

/// Record one upstream attempt.
pub fn record_upstream_attempt(endpoint: &str, outcome: &str, secs: f64) {
    UPSTREAM_CALLS_TOTAL.with_label_values(&[endpoint, outcome]).inc();
    UPSTREAM_DURATION_SECONDS.with_label_values(&[endpoint]).observe(secs);
}

/// Record a prefetch lifecycle event.
pub fn record_prefetch(event: &str) {
    PREFETCH_TOTAL.with_label_values(&[event]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_metrics() {
        // Isolated registry so tests do not depend on global registration order
        let registry = Registry::new();
        let counter = Counter::new("test_counter", "Test counter").unwrap();
        registry.register(Box::new(counter.clone())).unwrap();

        counter.inc();
        assert_eq!(counter.get(), 1.0);
    }

    #[test]
    fn test_recorders_do_not_panic() {
        record_operation("read", "ok");
        record_cache_lookup("hit");
        record_batch_flush("size", 5);
        record_circuit_transition("read", "open", 2.0);
        set_queue_depth("high", 3);
        record_upstream_attempt("write", "ok", 0.01);
        record_prefetch("queued");
    }

    #[test]
    fn test_encode_metrics() {
        let output = encode_metrics();
        assert!(output.is_empty() || output.starts_with('#') || output.contains("gridflow"));
    }
}
