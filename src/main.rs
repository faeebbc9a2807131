use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use newswire::config::Config;
use newswire::ingest::{IngestSettings, Scheduler};
use newswire::storage::{Database, DatabaseError};

#[derive(Parser, Debug)]
#[command(name = "newswire", about = "Scheduled news feed ingestion into SQLite")]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, value_name = "FILE", default_value = "newswire.toml")]
    config: PathBuf,

    /// Database file, overrides `database_path` from the config
    #[arg(long, value_name = "FILE")]
    database: Option<PathBuf>,

    /// Run every active feed once, print the report and exit
    #[arg(long)]
    once: bool,

    /// Print recent fetch runs for a feed and exit
    #[arg(long, value_name = "FEED")]
    history: Option<String>,

    /// Stop scheduling a feed (its articles are kept)
    #[arg(long, value_name = "NAME", conflicts_with = "activate")]
    deactivate: Option<String>,

    /// Resume scheduling a previously deactivated feed
    #[arg(long, value_name = "NAME")]
    activate: Option<String>,
}

const HISTORY_LIMIT: i64 = 20;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    let db_path = args.database.clone().unwrap_or_else(|| config.database_path.clone());
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("Error: {}", DatabaseError::InstanceLocked);
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::anyhow!("Failed to open database: {}", e));
        }
    };

    let added = db
        .sync_feeds(&config.feeds)
        .await
        .context("Failed to sync feeds")?;
    tracing::info!(configured = config.feeds.len(), added, "Feed registry synced");

    if let Some(name) = &args.history {
        let runs = db
            .recent_runs(name, HISTORY_LIMIT)
            .await
            .context("Failed to load fetch history")?;
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if let Some(name) = args.deactivate.as_deref().or(args.activate.as_deref()) {
        let active = args.activate.is_some();
        if !db.set_feed_active(name, active).await? {
            anyhow::bail!("No feed named '{}'", name);
        }
        println!("{} {}", if active { "Activated" } else { "Deactivated" }, name);
        return Ok(());
    }

    let client = reqwest::Client::builder()
        .user_agent(config.user_agent.as_str())
        .build()
        .context("Failed to build HTTP client")?;
    let scheduler = Scheduler::new(db, client, IngestSettings::from(&config));

    if args.once {
        let report = scheduler.run_once().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let handle = scheduler.start();
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received, draining in-flight runs");
    handle.shutdown().await;

    Ok(())
}
