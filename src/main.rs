//! # Integrations Entry Point
//!
//! `serve` runs the scheduler and token refresh loops; the other commands are
//! one-shot operator tools.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use integrations::app::{AppState, run_background};
use integrations::clock::SystemClock;
use integrations::config::ConfigLoader;
use integrations::models::SyncType;
use integrations::{db, telemetry};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "integrations", version, about = "Integration sync and health service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run scheduled syncs and proactive token refresh until interrupted
    Serve,
    /// Apply pending database migrations
    Migrate,
    /// Run one sync and print the outcome as JSON
    Sync {
        #[arg(long)]
        integration_id: Uuid,
        #[arg(long, default_value = "manual")]
        sync_type: SyncType,
    },
    /// Print the health snapshot of an organization as JSON
    Health {
        #[arg(long)]
        org_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new().load().context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing telemetry")?;
    if let Ok(redacted) = config.redacted_json() {
        info!(profile = %config.profile, config = %redacted, "Loaded configuration");
    }

    let pool = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;

    match cli.command {
        Command::Migrate => db::migrate(&pool).await?,
        Command::Serve => {
            db::migrate(&pool).await?;
            let state = AppState::build(config, pool, Arc::new(SystemClock))?;

            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown signal received");
                }
                signal.cancel();
            });

            run_background(state, shutdown).await?;
        }
        Command::Sync {
            integration_id,
            sync_type,
        } => {
            let state = AppState::build(config, pool, Arc::new(SystemClock))?;
            let outcome = state
                .orchestrator
                .run_sync(integration_id, sync_type)
                .await
                .with_context(|| format!("sync of integration {integration_id} did not run"))?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Health { org_id } => {
            let state = AppState::build(config, pool, Arc::new(SystemClock))?;
            let health = state.orchestrator.health().org_health(org_id).await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
    }

    Ok(())
}
