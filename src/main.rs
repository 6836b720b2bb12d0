//! Stratacache CLI
//!
//! Loads an optional YAML manager configuration, creates cache regions,
//! drives a synthetic workload against them and prints each region's
//! statistics.
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │   Config     │───▶│   Workload   │───▶│    Report    │
//! │ (YAML + CLI) │    │  (N workers  │    │ (text/JSON)  │
//! │              │    │  per region) │    │              │
//! └──────────────┘    └──────────────┘    └──────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stratacache::{
    AuxiliaryAttributes, AuxiliaryCache, AuxiliaryKind, CacheAccess, CacheManager, CacheStats,
    FileDiskCache, FileDiskCacheConfig, ManagerConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// Stratacache - multi-tier composite cache workload driver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML manager configuration
    #[arg(long, env = "STRATACACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Number of regions to exercise
    #[arg(long, env = "STRATACACHE_REGIONS", default_value = "3")]
    regions: usize,

    /// Operations per region
    #[arg(long, env = "STRATACACHE_OPERATIONS", default_value = "10000")]
    operations: usize,

    /// Distinct keys per region
    #[arg(long, env = "STRATACACHE_KEY_SPACE", default_value = "1000")]
    key_space: u64,

    /// Concurrent workers per region
    #[arg(long, env = "STRATACACHE_WORKERS", default_value = "8")]
    workers: usize,

    /// Attach a file disk tier under this directory (one subdirectory per region)
    #[arg(long, env = "STRATACACHE_DISK_DIR")]
    disk_dir: Option<PathBuf>,

    /// Statistics output format
    #[arg(long, value_enum, default_value = "text")]
    output: OutputFormat,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log format (text or json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    log_format: String,
}

#[derive(Debug, Serialize)]
struct Report {
    generated_at: String,
    elapsed_ms: u128,
    operations_per_region: usize,
    regions: Vec<CacheStats>,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting stratacache v{}", stratacache::version());
    info!("  Regions: {}", args.regions);
    info!("  Operations per region: {}", args.operations);
    info!("  Key space: {}", args.key_space);
    info!("  Workers per region: {}", args.workers);

    let config = match &args.config {
        Some(path) => {
            let source = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading config {}", path.display()))?;
            ManagerConfig::from_yaml(&source).context("parsing manager config")?
        }
        None => ManagerConfig::default(),
    };
    let manager = CacheManager::with_config(config.clone())?;

    let mut names: Vec<String> = config.regions.keys().cloned().collect();
    names.sort();
    let mut index = 0;
    while names.len() < args.regions {
        let name = format!("region-{}", index);
        if !names.contains(&name) {
            names.push(name);
        }
        index += 1;
    }
    names.truncate(args.regions.max(1));

    let mut caches = Vec::with_capacity(names.len());
    for name in &names {
        caches.push(open_region(&manager, &config, name, args.disk_dir.as_ref()).await?);
    }

    let started = Instant::now();
    let mut workers = Vec::new();
    for cache in &caches {
        for worker in 0..args.workers.max(1) {
            let cache = cache.clone();
            let operations = args.operations / args.workers.max(1);
            let key_space = args.key_space.max(1);
            let seed = (worker as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
            workers.push(tokio::spawn(async move {
                run_worker(cache, operations, key_space, seed).await
            }));
        }
    }
    for worker in workers {
        if let Err(e) = worker.await.context("worker task panicked")? {
            warn!(error = %e, "Worker stopped early");
        }
    }
    let elapsed = started.elapsed();
    info!(elapsed_ms = elapsed.as_millis() as u64, "Workload finished");

    let report = Report {
        generated_at: chrono::Utc::now().to_rfc3339(),
        elapsed_ms: elapsed.as_millis(),
        operations_per_region: args.operations,
        regions: manager.statistics(),
    };
    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            println!("# stratacache report {} ({} ms)", report.generated_at, report.elapsed_ms);
            for stats in &report.regions {
                println!("{}", stats);
            }
        }
    }

    manager.shutdown().await?;
    info!("Shutdown complete");
    Ok(())
}

async fn open_region(
    manager: &CacheManager,
    config: &ManagerConfig,
    name: &str,
    disk_dir: Option<&PathBuf>,
) -> Result<CacheAccess<String, String>> {
    let Some(disk_dir) = disk_dir else {
        return Ok(manager.get_cache::<String, String>(name)?);
    };

    let disk = FileDiskCache::<String, String>::open(FileDiskCacheConfig {
        name: format!("{}-disk", name),
        directory: disk_dir.join(name),
        ..FileDiskCacheConfig::default()
    })
    .await
    .with_context(|| format!("opening disk tier for region {}", name))?;
    let attributes = AuxiliaryAttributes::new(format!("{}-disk", name), AuxiliaryKind::Disk);

    Ok(manager.define_region(
        name,
        config.region_config(name)?,
        vec![(Arc::new(disk) as Arc<dyn AuxiliaryCache<String, String>>, attributes)],
    )?)
}

/// Mixed workload: mostly computed gets, some puts and removes
async fn run_worker(
    cache: CacheAccess<String, String>,
    operations: usize,
    key_space: u64,
    mut seed: u64,
) -> stratacache::Result<()> {
    for _ in 0..operations {
        seed = seed
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        let key = format!("key-{}", (seed >> 33) % key_space);

        match (seed >> 16) % 10 {
            0 => {
                cache.remove(&key).await?;
            }
            1 | 2 => {
                cache.put(key, format!("value-{}", seed)).await?;
            }
            _ => {
                let supplied = format!("loaded-{}", key);
                cache.get_with(key, || async move { Ok(supplied) }).await?;
            }
        }
    }
    Ok(())
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_format.eq_ignore_ascii_case("json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
