use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use txcache_core::SyncRunSummary;
use txcache_storage::{CacheStore, PgCacheStore};
use txcache_sync::{database_url_from_env, SyncConfig, SyncOrchestrator, SyncRequest, SyncScheduler};

#[derive(Debug, Parser)]
#[command(name = "txcache-cli")]
#[command(about = "Transaction cache sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync now and print its summary.
    Sync {
        #[command(subcommand)]
        target: SyncTarget,
    },
    /// Apply pending cache schema migrations.
    Migrate,
    /// Run the recurring day sync until Ctrl-C.
    Schedule,
    /// Print one cached transaction.
    Lookup { id: String },
}

#[derive(Debug, Subcommand)]
enum SyncTarget {
    Full,
    Day {
        /// Calendar day to refresh, defaults to today.
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let is_json = std::env::var("TXCACHE_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    if is_json {
        let _ = subscriber.json().try_init();
    } else {
        let _ = subscriber.try_init();
    }
}

async fn open_store(database_url: &str) -> Result<PgCacheStore> {
    let store = PgCacheStore::connect(database_url)
        .await
        .context("connecting to cache database")?;
    store.migrate().await.context("running cache migrations")?;
    Ok(store)
}

async fn build_orchestrator(config: &SyncConfig) -> Result<SyncOrchestrator> {
    let store = open_store(&config.database_url).await?;
    let feed = config.build_feed().context("building feed client")?;
    Ok(SyncOrchestrator::new(Arc::new(feed), Arc::new(store)).with_utc_offset(config.utc_offset()?))
}

fn report(summary: &SyncRunSummary) -> Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(summary)?);
    Ok(if summary.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    let command = match cli.command {
        Some(command) => command,
        None if SyncConfig::from_env()?.scheduler_enabled => Commands::Schedule,
        None => Commands::Sync {
            target: SyncTarget::Day { date: None },
        },
    };

    match command {
        Commands::Sync { target } => {
            let config = SyncConfig::from_env()?;
            let orchestrator = build_orchestrator(&config).await?;
            let request = match target {
                SyncTarget::Full => SyncRequest::Full,
                SyncTarget::Day { date } => SyncRequest::Day(date),
            };
            let summary = orchestrator.run_request(request).await;
            report(&summary)
        }
        Commands::Migrate => {
            open_store(&database_url_from_env()).await?;
            println!("cache schema is up to date");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Schedule => {
            let config = SyncConfig::from_env()?;
            let orchestrator = build_orchestrator(&config).await?;
            let scheduler = SyncScheduler::new(Arc::new(orchestrator), config.scheduler_config()?);
            scheduler.start().await?;
            println!("{}", serde_json::to_string_pretty(&scheduler.status().await)?);

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutdown requested");
            scheduler.stop().await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Lookup { id } => {
            let store = PgCacheStore::connect(&database_url_from_env())
                .await
                .context("connecting to cache database")?;
            match store.get(&id).await? {
                Some(record) => {
                    println!("{}", serde_json::to_string_pretty(&record)?);
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    eprintln!("transaction {id} is not cached");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}
