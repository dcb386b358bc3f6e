//! Grid engine entry point
//!
//! Thin CLI shell around the supervisor: parses arguments, initialises
//! logging and hands the loaded configuration to `Supervisor::run`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use grid_engine::supervisor::Supervisor;
use grid_engine::Config;

#[derive(Parser, Debug)]
#[command(name = "grid-engine")]
#[command(about = "Regime-gated grid trading engine for spot crypto markets", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the trading engine
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/grid.json")]
        config: String,

        /// Simulate order mutations instead of sending them to the venue
        #[arg(long)]
        dry_run: bool,

        /// Coordinator tick interval in seconds (overrides config)
        #[arg(long)]
        interval: Option<u64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenv::dotenv().ok();

    match cli.command {
        Commands::Run {
            config,
            dry_run,
            interval,
        } => {
            let mut config = Config::from_file(&config)
                .context(format!("Failed to load config from {}", config))?;

            if dry_run {
                config.exchange.dry_run = true;
            }
            if let Some(interval) = interval {
                config.trading.tick_period_s = interval;
            }

            if config.exchange.dry_run {
                info!("Dry-run mode: venue mutations are simulated");
            }

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to build tokio runtime")?;

            runtime.block_on(Supervisor::new(config).run())
        }
    }
}
