//! # Switchyard Server
//!
//! Real-time event gateway for chat clients.
//!
//! ## Usage
//!
//! ```bash
//! # Run with switchyard.toml from the working directory
//! switchyard
//!
//! # Run with a specific config file
//! switchyard --config /path/to/switchyard.toml
//!
//! # Override settings with environment variables
//! SWITCHYARD__PORT=8080 SWITCHYARD__AUTH__JWT_SECRET=... switchyard
//! ```

mod auth;
mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "switchyard=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match config_path() {
        Some(path) => config::Config::from_file(&path)?,
        None => config::Config::load()?,
    };

    tracing::info!(
        "Starting Switchyard server on {}:{}",
        config.host,
        config.port
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}

/// Value of `--config <path>`, if given.
fn config_path() -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
    }
    None
}
