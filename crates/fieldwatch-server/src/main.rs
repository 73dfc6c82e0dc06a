//! # Fieldwatch Server
//!
//! Realtime telemetry relay between field enumerators and their supervisors.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! fieldwatch
//!
//! # Run with custom config
//! fieldwatch --config /path/to/fieldwatch.toml
//!
//! # Run with environment variables
//! PORT=8080 FIELDWATCH_LIMITS__OUTBOUND_BUFFER=64 fieldwatch
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Fieldwatch - realtime telemetry relay for field enumerators
#[derive(Debug, Parser)]
#[command(name = "fieldwatch")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file to load instead of searching the default locations
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fieldwatch=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match args.config {
        Some(path) => config::Config::from_file(path)?,
        None => config::Config::load()?,
    };

    tracing::info!(
        "Starting telemetry hub on {}:{}",
        config.host,
        config.port
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
