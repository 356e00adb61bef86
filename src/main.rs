//! AUTO - monitoring and control plane for local AI coding-agent sessions

mod agent;
mod alert;
mod api;
mod cli;
mod config;
mod provider;
mod session;
mod store;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "auto=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting AUTO v{}", env!("CARGO_PKG_VERSION"));

    // Run CLI
    cli::run()?;

    Ok(())
}
