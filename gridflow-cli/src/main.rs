//! gridflow - drive the request orchestrator from the command line.
//!
//! ```bash
//! # Synthetic workload against the in-memory upstream
//! gridflow simulate --reads 500 --writes 100
//!
//! # Same workload against a real upstream, with a config file
//! gridflow simulate --upstream-url http://localhost:8080 --config gridflow.json
//!
//! # Effective configuration after presets, file and GRIDFLOW_* overrides
//! gridflow config --preset high-throughput
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use gridflow_core::{GridRange, Operation, Payload, Priority};
use gridflow_orchestrator::{
    HttpUpstream, MemoryUpstream, Orchestrator, OrchestratorConfig, OrchestratorStats, Upstream,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SHEET: &str = "Sheet1";

#[derive(Parser)]
#[command(name = "gridflow")]
#[command(version)]
#[command(about = "gridflow - request orchestration for quota-constrained spreadsheet APIs", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true, env = "GRIDFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Preset used when no config file is given
    #[arg(long, global = true, value_enum, default_value_t = Preset::Default)]
    preset: Preset,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Preset {
    Default,
    LowLatency,
    HighThroughput,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a synthetic read/write workload and print statistics
    Simulate {
        /// Number of read operations
        #[arg(long, default_value_t = 200)]
        reads: usize,

        /// Number of write operations
        #[arg(long, default_value_t = 50)]
        writes: usize,

        /// Number of distinct resources
        #[arg(long, default_value_t = 2)]
        resources: usize,

        /// Rows per resource
        #[arg(long, default_value_t = 500)]
        rows: u32,

        /// Simulated latency of the in-memory upstream
        #[arg(long, default_value_t = 20)]
        latency_ms: u64,

        /// Seed for the workload generator
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Send calls to an HTTP upstream instead of the in-memory one
        #[arg(long)]
        upstream_url: Option<String>,

        /// Print the Prometheus metrics after the run
        #[arg(long)]
        metrics: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as JSON
    Config,
}

#[derive(Serialize)]
struct SimulationReport {
    generated_at: String,
    operations: usize,
    succeeded: usize,
    failed: BTreeMap<String, usize>,
    elapsed_ms: u64,
    upstream_calls: Option<usize>,
    stats: OrchestratorStats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("gridflow_orchestrator=info,gridflow=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref(), cli.preset)?;

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Simulate { reads, writes, resources, rows, latency_ms, seed, upstream_url, metrics, json } => {
            if metrics {
                gridflow_orchestrator::init_metrics();
            }

            let (upstream, memory): (Arc<dyn Upstream>, Option<Arc<MemoryUpstream>>) = match upstream_url {
                Some(url) => {
                    let http = HttpUpstream::new(url, config.executor.attempt_timeout())
                        .context("failed to create HTTP upstream")?;
                    (Arc::new(http) as Arc<dyn Upstream>, None)
                }
                None => {
                    let memory = seeded_upstream(resources, rows, Duration::from_millis(latency_ms));
                    (memory.clone() as Arc<dyn Upstream>, Some(memory))
                }
            };

            let mut rng = StdRng::seed_from_u64(seed);
            let workload = build_workload(&mut rng, reads, writes, resources.max(1), rows.max(40));
            info!(operations = workload.len(), "Starting simulation");

            let report = run(config, upstream, workload, memory.as_deref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }

            if metrics {
                println!();
                print!("{}", gridflow_orchestrator::metrics::encode_metrics());
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>, preset: Preset) -> anyhow::Result<OrchestratorConfig> {
    let mut config = match path {
        Some(path) => OrchestratorConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => match preset {
            Preset::Default => OrchestratorConfig::default(),
            Preset::LowLatency => OrchestratorConfig::low_latency(),
            Preset::HighThroughput => OrchestratorConfig::high_throughput(),
        },
    };
    config
        .apply_env(|key| std::env::var(key).ok())
        .context("invalid GRIDFLOW_* environment override")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn resource_name(index: usize) -> String {
    format!("sheet-{index}")
}

fn seeded_upstream(resources: usize, rows: u32, latency: Duration) -> Arc<MemoryUpstream> {
    let upstream = MemoryUpstream::new().with_latency(latency);
    for r in 0..resources.max(1) {
        let values = (0..rows)
            .map(|row| (0..4).map(|col| serde_json::json!(format!("R{row}C{col}"))).collect())
            .collect();
        upstream.seed(&resource_name(r), GridRange::new(SHEET, 0..rows, 0..4), values);
    }
    Arc::new(upstream)
}

/// Mixed workload: sequential scans, random overlapping windows and
/// single-cell writes, interleaved.
fn build_workload(rng: &mut impl Rng, reads: usize, writes: usize, resources: usize, rows: u32) -> Vec<Operation> {
    let mut cursors = vec![0u32; resources];
    let mut ops = Vec::with_capacity(reads + writes);
    let (mut reads_left, mut writes_left) = (reads, writes);

    while reads_left + writes_left > 0 {
        let resource = rng.gen_range(0..resources);
        let is_write = rng.gen_range(0..reads_left + writes_left) < writes_left;

        if is_write {
            writes_left -= 1;
            let row = rng.gen_range(0..rows);
            let col = rng.gen_range(0..4);
            let value = rng.gen_range(0..1_000);
            ops.push(Operation::write(
                resource_name(resource),
                GridRange::new(SHEET, row..row + 1, col..col + 1),
                Payload::values(vec![vec![serde_json::json!(value)]]),
            ));
            continue;
        }

        reads_left -= 1;
        let range = if rng.gen_bool(0.5) {
            let start = cursors[resource];
            cursors[resource] = (start + 10) % (rows - 10);
            GridRange::new(SHEET, start..start + 10, 0..4)
        } else {
            let start = rng.gen_range(0..rows - 20);
            let len = rng.gen_range(1..=20);
            GridRange::new(SHEET, start..start + len, 0..4)
        };
        let priority = if rng.gen_bool(0.1) { Priority::High } else { Priority::Medium };
        ops.push(Operation::read(resource_name(resource), range).with_priority(priority));
    }
    ops
}

async fn run(
    config: OrchestratorConfig,
    upstream: Arc<dyn Upstream>,
    workload: Vec<Operation>,
    memory: Option<&MemoryUpstream>,
) -> anyhow::Result<SimulationReport> {
    let orchestrator = Orchestrator::new(config, upstream).context("failed to start orchestrator")?;
    let started = Instant::now();

    let operations = workload.len();
    let handles: Vec<_> = workload.into_iter().map(|op| orchestrator.submit(op)).collect();
    let results = futures::future::join_all(handles).await;
    orchestrator.shutdown().await;

    let mut succeeded = 0;
    let mut failed = BTreeMap::new();
    for result in results {
        match result {
            Ok(_) => succeeded += 1,
            Err(err) => *failed.entry(err.error.label().to_string()).or_insert(0) += 1,
        }
    }

    Ok(SimulationReport {
        generated_at: chrono::Utc::now().to_rfc3339(),
        operations,
        succeeded,
        failed,
        elapsed_ms: started.elapsed().as_millis() as u64,
        upstream_calls: memory.map(MemoryUpstream::total_calls),
        stats: orchestrator.stats().await,
    })
}

fn print_report(report: &SimulationReport) {
    let stats = &report.stats;
    println!("==================================================");
    println!("  gridflow simulate v{}", env!("CARGO_PKG_VERSION"));
    println!("==================================================");
    println!("  Operations:       {}", report.operations);
    println!("  Succeeded:        {}", report.succeeded);
    for (label, count) in &report.failed {
        println!("  Failed ({label}): {count}");
    }
    println!("  Elapsed:          {} ms", report.elapsed_ms);
    if let Some(calls) = report.upstream_calls {
        println!("  Upstream calls:   {calls}");
    }
    println!();
    println!("  Cache hit rate:   {:.1}%", stats.cache.hit_rate * 100.0);
    println!("  Dedup joins:      {}", stats.dedup.joins);
    println!("  Merge groups:     {} ({} fetches saved)", stats.merger.groups_flushed, stats.merger.fetches_saved);
    println!(
        "  Write batches:    {} (avg size {:.1})",
        stats.batcher.batches_flushed, stats.batcher.avg_batch_size
    );
    println!("  Upstream retries: {}", stats.executor.retries);
    println!("  Prefetches:       {}", stats.prefetch.tasks_completed);
    println!("==================================================");
}
