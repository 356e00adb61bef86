//! CLI commands

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::alert;
use crate::api;
use crate::config::Config;
use crate::provider::opencode::{CliProvider, StorageProvider, TokenCosts};
use crate::provider::Registry;
use crate::session;
use crate::store::Store;

#[derive(Parser)]
#[command(name = "auto")]
#[command(about = "Monitoring and control plane for local AI coding-agent sessions", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to config file (default: ~/.config/auto/config.yaml)
    #[arg(long, short)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the control plane (default)
    Run {
        /// Serve the HTTP inspection API even if disabled in config
        #[arg(long)]
        api: bool,
    },

    /// List stored sessions
    Sessions {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,

        /// Maximum rows (0 = all)
        #[arg(long, default_value = "50")]
        limit: u32,
    },

    /// Show aggregate statistics from the store
    Stats,

    /// Delete stored history older than the retention horizon
    Cleanup {
        /// Days of history to keep (default: storage.max_history)
        #[arg(long)]
        days: Option<u32>,
    },

    /// Export stored sessions, alerts, and statistics as JSON
    Export {
        /// Output file (default: stdout)
        #[arg(long)]
        out: Option<String>,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;

    let store = Store::open(config.resolve_db_path()?)?;

    // Create a multi-threaded runtime for CLI operations
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        match cli.command.unwrap_or(Commands::Run { api: false }) {
            Commands::Run { api } => run_control_plane(config, store, api).await,

            Commands::Sessions { status, limit } => {
                let sessions = store.sessions().list(limit, status.as_deref()).await?;

                if sessions.is_empty() {
                    println!("No sessions found");
                } else {
                    for session in sessions {
                        println!(
                            "[{}] {} - {} ({}) - {}",
                            session.id.chars().take(8).collect::<String>(),
                            session.agent_name,
                            session.agent_type,
                            session.status,
                            if session.directory.is_empty() {
                                "-"
                            } else {
                                session.directory.as_str()
                            },
                        );
                    }
                }
                Ok(())
            }

            Commands::Stats => {
                let stats = store.stats().await?;
                println!("Sessions:   {}", stats.total_sessions);
                for (status, count) in &stats.sessions_by_status {
                    println!("  {status}: {count}");
                }
                println!("Tokens in:  {}", stats.total_tokens_in);
                println!("Tokens out: {}", stats.total_tokens_out);
                println!("Cost:       ${:.4}", stats.total_cost);
                println!("Errors:     {}", stats.total_errors);
                println!("Unread alerts: {}", stats.unread_alerts);
                Ok(())
            }

            Commands::Cleanup { days } => {
                let days = days.unwrap_or(config.storage.max_history);
                store.cleanup(days).await?;
                println!("Removed history older than {days} days");
                Ok(())
            }

            Commands::Export { out } => {
                let json = store.export_json().await?;
                match out {
                    Some(path) => {
                        std::fs::write(&path, json)
                            .with_context(|| format!("Failed to write {path}"))?;
                        println!("Exported to {path}");
                    }
                    None => println!("{json}"),
                }
                Ok(())
            }
        }
    })
}

/// Assemble the registry, alert manager, session manager, and optional
/// API server, then block until ctrl-c.
async fn run_control_plane(config: Config, store: Store, force_api: bool) -> Result<()> {
    let registry = Arc::new(Registry::new());

    if config.providers.opencode.enabled {
        let provider = StorageProvider::new(
            config.resolve_storage_path()?,
            config.opencode_watch_interval(),
            config.opencode_max_age(),
        )
        .with_pricing(TokenCosts {
            input: config.metrics.token_cost_input,
            output: config.metrics.token_cost_output,
        })
        .with_context_limit(config.alerts.context_limit_warning);
        registry.register(Arc::new(provider));
    }

    if config.providers.opencode_cli.enabled {
        let cli_cfg = &config.providers.opencode_cli;
        let mut provider = CliProvider::new(
            cli_cfg.list_limit,
            std::time::Duration::from_secs(cli_cfg.watch_interval.max(1)),
            std::time::Duration::from_secs(cli_cfg.max_age),
        );
        if !cli_cfg.work_dir.is_empty() {
            provider = provider.with_work_dir(&cli_cfg.work_dir);
        }
        registry.register(Arc::new(provider));
    }

    if registry.list().is_empty() {
        warn!("No providers enabled; nothing to monitor");
    }

    let alerts = Arc::new(alert::Manager::new(&config.alerts, Some(store.clone())));

    let manager = Arc::new(session::Manager::new(
        config.clone(),
        Some(store),
        registry,
        Some(alerts),
    ));

    let scope = CancellationToken::new();
    Arc::clone(&manager).start(&scope).await?;

    if force_api || config.api.enabled {
        let server = api::Server::bind(&config.api.listen_addr, Arc::clone(&manager)).await?;
        let api_scope = scope.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run(api_scope).await {
                warn!("API server stopped: {}", e);
            }
        });
    }

    info!("Control plane started; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    scope.cancel();
    manager.stop();

    Ok(())
}
