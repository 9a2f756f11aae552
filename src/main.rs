use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use drivetrain_runtime::config::DriveConfig;
use drivetrain_runtime::motor::{SpeedMode, Topology};

/// Pulse drivetrain runtime: mixes controller input into ESC pulses
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// JSON config file (calibration, axes, safety button)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured wheel layout
    #[arg(short, long, value_enum)]
    topology: Option<Topology>,

    /// Start in low speed mode
    #[arg(long)]
    low_speed: bool,

    /// Log pulses instead of publishing them
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init(); // installs the subscriber globally

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match DriveConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Config error ({}): {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => DriveConfig::default(),
    };
    if let Some(topology) = args.topology {
        config.topology = topology;
    }
    if args.low_speed {
        config.speed = SpeedMode::Low;
    }
    info!("Config: {:?}", config);

    if let Err(e) = drivetrain_runtime::runtime::run(config, args.dry_run).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
