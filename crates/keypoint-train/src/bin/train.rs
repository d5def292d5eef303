//! `train` binary: entry point for the keypoint training pipeline.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin train -- --config run.json
//! cargo run --bin train -- --config run.json --seed 0 --seed 1 --cuda
//! cargo run --bin train -- --sweep sweep.json --data-root /data
//! ```

use clap::Parser;
use keypoint_train::config::{RunConfig, SweepConfig};
use keypoint_train::trainer::run_all;
use std::path::PathBuf;
use tracing::{error, info};

/// Command-line arguments for the training binary.
#[derive(Parser, Debug)]
#[command(
    name = "train",
    version,
    about = "Heatmap keypoint training pipeline",
    long_about = None
)]
struct Args {
    /// Path to a JSON run configuration.
    ///
    /// If neither this nor `--sweep` is provided, the default `RunConfig` is
    /// used.
    #[arg(short, long, value_name = "FILE", conflicts_with = "sweep")]
    config: Option<PathBuf>,

    /// Path to a JSON sweep (`{ "seeds": [...], "runs": [...] }`).
    #[arg(long, value_name = "FILE")]
    sweep: Option<PathBuf>,

    /// Nominal seed; repeat to run every configuration once per seed.
    #[arg(long = "seed", value_name = "SEED")]
    seeds: Vec<u64>,

    /// Override the directory containing the dataset directories.
    #[arg(long, value_name = "DIR")]
    data_root: Option<PathBuf>,

    /// Override the directory receiving run directories.
    #[arg(long, value_name = "DIR")]
    output_root: Option<PathBuf>,

    /// Train on the first CUDA device when available.
    #[arg(long, default_value_t = false)]
    cuda: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();

    // Initialise tracing subscriber.
    let log_level_filter = args
        .log_level
        .parse::<tracing_subscriber::filter::LevelFilter>()
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO);

    tracing_subscriber::fmt()
        .with_max_level(log_level_filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    info!("Keypoint Training Pipeline v{}", keypoint_train::VERSION);

    let mut configs = match load_configs(&args) {
        Ok(configs) => configs,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    // Apply CLI overrides.
    if !args.seeds.is_empty() {
        configs = args
            .seeds
            .iter()
            .flat_map(|&seed| configs.iter().map(move |c| RunConfig { seed, ..c.clone() }))
            .collect();
    }
    for config in &mut configs {
        if let Some(dir) = &args.data_root {
            config.data_root = dir.clone();
        }
        if let Some(dir) = &args.output_root {
            config.output_root = dir.clone();
        }
    }

    info!("{} run(s) queued", configs.len());
    info!("  device       : {}", if args.cuda { "CUDA if available" } else { "CPU" });

    match run_all(configs, args.cuda) {
        Ok(summaries) => {
            for summary in &summaries {
                info!("finished {}", summary.run_dir.display());
            }
        }
        Err(e) => {
            error!("Training failed: {e}");
            std::process::exit(1);
        }
    }
}

fn load_configs(args: &Args) -> Result<Vec<RunConfig>, keypoint_train::ConfigError> {
    if let Some(path) = args.sweep.as_deref() {
        info!("Loading sweep from {}", path.display());
        return Ok(SweepConfig::from_json(path)?.expand());
    }
    match args.config.as_deref() {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            Ok(vec![RunConfig::from_json(path)?])
        }
        None => {
            info!("No configuration file provided, using defaults");
            Ok(vec![RunConfig::default()])
        }
    }
}
