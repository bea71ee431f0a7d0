//! Block fusion driver.
//!
//! Fuses the source views of a catalog into a chunked Zarr container,
//! optionally followed by a multi-resolution pyramid.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use block_fusion::{
    FusionDriver, FusionJobConfig, LocalExecutor, MeanFusion, NoMetadata, ZarrViewCatalogLoader,
};

#[derive(Parser, Debug)]
#[command(name = "fusion-driver")]
#[command(about = "Block-parallel fusion of registered views into a Zarr container")]
struct Args {
    /// Job configuration file path
    #[arg(short, long, env = "FUSION_CONFIG", default_value = "fusion.yaml")]
    config: PathBuf,

    /// Worker threads (default: from config, else all CPUs)
    #[arg(short, long)]
    threads: Option<usize>,

    /// Attempts per block before the stage fails
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Fuse without reading source chunks ahead
    #[arg(long)]
    no_prefetch: bool,

    /// Skip the fusion.json sidecar
    #[arg(long)]
    no_metadata: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!(config = %args.config.display(), "Starting fusion driver");

    let mut config = FusionJobConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.compression = config.compression.with_env_overrides();
    if let Some(threads) = args.threads {
        config.executor.threads = Some(threads);
    }
    if let Some(max_attempts) = args.max_attempts {
        config.executor.max_attempts = max_attempts;
    }
    if args.no_prefetch {
        config.prefetch = false;
    }

    config.validate()?;
    info!(
        container = %config.container.display(),
        dataset = %config.dataset_path(),
        backend = %config.backend,
        block_size = ?config.block_size,
        data_type = %config.output_data_type(),
        "Loaded configuration"
    );
    if args.check {
        info!("Configuration is valid");
        return Ok(());
    }

    let loader = ZarrViewCatalogLoader::from_file(&config.catalog)
        .with_context(|| format!("loading catalog {}", config.catalog.display()))?;
    let executor = LocalExecutor::from_config(&config.executor)?;

    let mut driver = FusionDriver::new(&config, &loader, &MeanFusion, &executor);
    if args.no_metadata {
        driver = driver.with_metadata(NoMetadata);
    }

    let summary = match driver.run() {
        Ok(summary) => summary,
        Err(e) => {
            error!(error = %e, preflight = e.is_preflight(), "Fusion failed");
            return Err(e.into());
        }
    };

    let report = serde_json::json!({
        "boundingBox": summary.bounding_box,
        "anisotropyFactor": summary.anisotropy_factor,
        "datasets": summary
            .datasets
            .iter()
            .map(|d| serde_json::json!({
                "path": d.dataset,
                "dimensions": d.dimensions,
                "downsamplingFactors": d.downsampling_factors,
            }))
            .collect::<Vec<_>>(),
        "stages": summary
            .stages
            .iter()
            .map(|s| serde_json::json!({
                "stage": s.stage,
                "tasks": s.tasks,
                "written": s.written,
                "skipped": s.skipped,
                "elapsedMs": s.elapsed.as_millis() as u64,
            }))
            .collect::<Vec<_>>(),
        "elapsedMs": summary.elapsed.as_millis() as u64,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
