// ABOUTME: Entry point for the evobot binary.
// ABOUTME: Parses CLI arguments, initializes tracing, and runs the bot or an operator command.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use evobot_core::{LeaderLease, SystemClock};
use evobot_runtime::{App, Collaborators, RuntimeConfig, discord_client, migrate_tables, open_store};
use evobot_store::{ChatTransport, IdentityResolver, LEASE_KEY, Store};
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "evobot")]
#[command(about = "Guild operations bot with chat-backed durable state")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the bot until interrupted
    Run,
    /// Inspect or edit stored snapshots
    Store {
        #[command(subcommand)]
        action: StoreAction,
    },
    /// Migrate legacy member tables (defaults to EVOBOT_MIGRATE_KEYS)
    Migrate { keys: Vec<String> },
    /// Show the current leader lease
    Lease,
}

#[derive(Subcommand)]
enum StoreAction {
    Get { key: String },
    Put { key: String, json: String },
    Delete { key: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "evobot=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = RuntimeConfig::from_env().context("loading configuration")?;

    match cli.command {
        Command::Run => run(config).await,
        Command::Store { action } => store_command(&config, action).await,
        Command::Migrate { keys } => migrate(&config, keys).await,
        Command::Lease => show_lease(&config).await,
    }
}

async fn run(config: RuntimeConfig) -> anyhow::Result<()> {
    tracing::info!("evobot starting as instance {}", config.instance_id);
    let collaborators = Collaborators::from_config(&config)?;
    let app = App::bootstrap(&config, collaborators, Arc::new(SystemClock)).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for shutdown signal: {}", err);
            return;
        }
        tracing::info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    app.run(shutdown_rx).await;
    tracing::info!("evobot stopped");
    Ok(())
}

/// The store alone, reached through Discord when a token is configured.
async fn operator_store(config: &RuntimeConfig) -> anyhow::Result<Store> {
    let transport = match discord_client(config) {
        Ok(client) => Some(Arc::new(client) as Arc<dyn ChatTransport>),
        Err(_) => None,
    };
    Ok(open_store(config, transport).await?)
}

async fn store_command(config: &RuntimeConfig, action: StoreAction) -> anyhow::Result<()> {
    let store = operator_store(config).await?;
    match action {
        StoreAction::Get { key } => {
            let value = store.get_value(&key).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        StoreAction::Put { key, json } => {
            let value: serde_json::Value = serde_json::from_str(&json).context("parsing value")?;
            store.put_value(&key, &value).await?;
            println!("stored {}", key);
        }
        StoreAction::Delete { key } => {
            store.delete(&key).await?;
            println!("deleted {}", key);
        }
    }
    Ok(())
}

async fn migrate(config: &RuntimeConfig, keys: Vec<String>) -> anyhow::Result<()> {
    let client = Arc::new(discord_client(config)?);
    let store = open_store(config, Some(client.clone())).await?;
    let keys = if keys.is_empty() { config.migrate_keys.clone() } else { keys };

    let resolver: &dyn IdentityResolver = client.as_ref();
    for (key, report) in migrate_tables(&store, &keys, resolver).await? {
        println!("{}: {}", key, report);
        for legacy in &report.unresolved {
            println!("  unresolved: {}", legacy);
        }
    }
    Ok(())
}

async fn show_lease(config: &RuntimeConfig) -> anyhow::Result<()> {
    let store = operator_store(config).await?;
    match store.get_opt::<LeaderLease>(LEASE_KEY).await? {
        Some(lease) => {
            let state = if lease.is_expired(chrono::Utc::now()) { "expired" } else { "active" };
            println!(
                "{} ({}): acquired {}, expires {}",
                lease.holder_id, state, lease.acquired_at, lease.expires_at
            );
        }
        None => println!("no lease held"),
    }
    Ok(())
}
