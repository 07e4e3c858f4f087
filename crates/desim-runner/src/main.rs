//! # desim
//!
//! CLI runner for the desim discrete-event simulation kernel.

use clap::{Parser, Subcommand};
use desim_common::{parse_time, VirtualTime};
use desim_engine::metric_defs;
use desim_model::{load_configs, SimulationConfig};
use desim_runner::{run_simulation, RunnerError};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// CLI Configuration
// ============================================================================

/// desim - discrete-event simulation kernel runner
#[derive(Parser, Debug)]
#[command(name = "desim")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the ring workload from YAML configuration files
    Run(RunArgs),
    /// Print the merged configuration as YAML
    Config(ConfigArgs),
    /// List all available metrics with descriptions and labels
    Metrics,
}

/// Arguments of `desim run`
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path(s) to YAML configuration file(s). Multiple files are merged in
    /// order (later overrides earlier).
    #[arg(required = true)]
    pub configs: Vec<PathBuf>,

    /// Seed for workload jitter (overrides workload.seed)
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Number of ring nodes, one rank each in distributed mode
    #[arg(short, long)]
    pub ranks: Option<u32>,

    /// Last virtual time to run. Accepts units: 500ms, 10s, 1m30s
    #[arg(short, long, value_parser = parse_time)]
    pub end_time: Option<VirtualTime>,

    /// Write the JSON report to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Arguments of `desim config`
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Path(s) to YAML configuration file(s), merged in order
    #[arg(required = true)]
    pub configs: Vec<PathBuf>,
}

fn load(paths: &[PathBuf]) -> Result<SimulationConfig, RunnerError> {
    let paths: Vec<&Path> = paths.iter().map(|p| p.as_path()).collect();
    Ok(load_configs(&paths)?)
}

// ============================================================================
// Commands
// ============================================================================

fn run_command(args: RunArgs) -> Result<(), RunnerError> {
    let mut config = load(&args.configs)?;
    if let Some(seed) = args.seed {
        config.workload.seed = seed;
    }
    if let Some(ranks) = args.ranks {
        config.distributed.ranks = ranks;
    }
    if let Some(end_time) = args.end_time {
        config.engine.stop_at = Some(end_time);
        config.distributed.end_time = Some(end_time);
    }

    let report = run_simulation(&config)?;
    let json = serde_json::to_string_pretty(&report)?;
    match args.output {
        Some(path) => {
            std::fs::write(&path, json)?;
            eprintln!("Report written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn config_command(args: ConfigArgs) -> Result<(), RunnerError> {
    let config = load(&args.configs)?;
    print!("{}", config.to_yaml()?);
    Ok(())
}

/// Print information about all available metrics
fn print_metrics_info() {
    println!("desim Available Metrics");
    println!("=======================\n");

    let categories = [
        ("Engine", "desim.engine."),
        ("Real-time Pacing", "desim.realtime."),
        ("Synchronization", "desim.sync."),
    ];

    for (category_name, prefix) in categories {
        println!("## {}\n", category_name);

        for metric in metric_defs::ALL {
            if metric.name.starts_with(prefix) {
                println!("  {}", metric.name);
                println!("    Type: {}", metric.kind);
                let unit_str = metric.unit_str();
                if !unit_str.is_empty() {
                    println!("    Unit: {}", unit_str);
                }
                if !metric.description.is_empty() {
                    println!("    Description: {}", metric.description);
                }
                if !metric.labels.is_empty() {
                    println!("    Labels: {}", metric.labels.join(", "));
                }
                println!();
            }
        }
    }
}

fn main() -> Result<(), RunnerError> {
    // Default to "warn" level if RUST_LOG is not set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    metric_defs::describe_metrics();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_command(args)?,
        Commands::Config(args) => config_command(args)?,
        Commands::Metrics => print_metrics_info(),
    }

    Ok(())
}
