mod cli;
mod notify_adapters;
mod wiring;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use marmot_config::ServerConfig;
use tracing_subscriber::EnvFilter;
use wiring::{Backend, Daemon};

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).with_target(false).init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { ephemeral } => run(ephemeral).await,
        Command::Migrate => migrate().await,
        Command::ReconcileNow { kind } => reconcile_now(kind.into()).await,
    }
}

async fn run(ephemeral: bool) -> Result<()> {
    let (backend, owner_id, encryption_key) = if ephemeral {
        tracing::warn!("running with an in-memory store; state will not survive a restart");
        (Backend::ephemeral(), "local".to_string(), None)
    } else {
        let config = ServerConfig::from_env()?;
        let backend = Backend::postgres(&config.database_url).await?;
        (backend, hostname(), config.encryption_key)
    };

    let daemon = Daemon::start(backend, owner_id, encryption_key);

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    daemon.shutdown(SHUTDOWN_DEADLINE).await;
    Ok(())
}

async fn migrate() -> Result<()> {
    let config = ServerConfig::from_env()?;
    // `PostgresStore::connect` runs the embedded migrations as part of
    // establishing the pool; connecting and dropping the store is the
    // whole operation.
    marmot_store::PostgresStore::connect(&config.database_url).await?;
    tracing::info!("migrations applied");
    Ok(())
}

async fn reconcile_now(kind: marmot_domain::RuleKind) -> Result<()> {
    let config = ServerConfig::from_env()?;
    let store = std::sync::Arc::new(marmot_store::PostgresStore::connect(&config.database_url).await?);
    let rules = store.rule_repository(kind);

    let (handle, tasks) = marmot_membership::spawn(marmot_membership::MembershipServiceConfig::new(kind), rules.clone(), store.clone(), store.clone());

    let report = marmot_reconciler::reconcile(&marmot_reconciler::ReconcileRequest { kind }, store.as_ref(), "manual", "cli", rules.as_ref(), &handle).await?;

    match report {
        Some(report) => tracing::info!(rules_swept = report.rules_swept, errors = ?report.errors, "reconcile complete"),
        None => tracing::warn!("advisory lock held elsewhere; nothing swept"),
    }

    for task in tasks {
        task.abort();
    }
    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "marmotd".to_string())
}
