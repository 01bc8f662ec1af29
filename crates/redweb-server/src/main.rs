//! # RedWeb Server
//!
//! WebSocket routing server: routes, handlers and services are declared in
//! `redweb.toml`.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (a single root route)
//! redweb
//!
//! # Run with custom config
//! redweb --config /path/to/redweb.toml
//!
//! # Run with environment variables
//! REDWEB_PORT=8080 REDWEB_HOST=0.0.0.0 redweb
//! ```

mod config;
mod handlers;
mod metrics;
mod server;
mod services;

use anyhow::{bail, Result};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "redweb=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = config_arg(std::env::args().skip(1))?;
    let config = config::Config::load(config_path.as_deref())?;

    tracing::info!("Starting RedWeb server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    server::run_server(config).await?;

    Ok(())
}

/// Extract `--config <path>` from the command line.
fn config_arg(mut args: impl Iterator<Item = String>) -> Result<Option<PathBuf>> {
    let mut path = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => match args.next() {
                Some(value) => path = Some(PathBuf::from(value)),
                None => bail!("--config requires a path"),
            },
            other => match other.strip_prefix("--config=") {
                Some(value) => path = Some(PathBuf::from(value)),
                None => bail!("Unknown argument: {other}"),
            },
        }
    }
    Ok(path)
}
