//! Operator CLI for the parcel storage layer.

mod error;

use crate::error::{ErrorKind, Result};
use clap::{Parser, Subcommand};
use exn::ResultExt;
use parcel_config::Config;
use parcel_database::{Database, gc};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "info,parcel=debug,parcel_database=debug";

/// Maintain parcel databases: copy between backends, upgrade schemas and
/// collect expired records.
#[derive(Parser, Debug)]
#[command(name = "parcel")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to `config.toml` in the platform config directory)
    #[arg(short, long, env = "PARCEL_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy API keys, files, hotlinks and end-to-end info to another database
    Migrate {
        /// Source connection string; the database must already exist
        #[arg(long)]
        from: String,
        /// Destination connection string; created if needed
        #[arg(long)]
        to: String,
    },
    /// Bring a database up to the current schema version
    Upgrade {
        /// Connection string (overrides the configuration)
        #[arg(long)]
        database: Option<String>,
    },
    /// Remove expired sessions, files, hotlinks and upload statuses
    Gc {
        /// Connection string (overrides the configuration)
        #[arg(long)]
        database: Option<String>,
        /// Keep running, collecting on the configured interval until interrupted
        #[arg(long)]
        watch: bool,
    },
    /// Show the backend and schema versions of a database
    Info {
        /// Connection string (overrides the configuration)
        #[arg(long)]
        database: Option<String>,
    },
}

async fn open_configured(config: &Config, database: Option<&str>) -> Result<Database> {
    let url = database.unwrap_or(&config.database.url);
    Database::open(url, config.database.strict).await.or_raise(|| ErrorKind::Open("configured"))
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    match cli.command {
        Command::Migrate { from, to } => {
            let report = parcel_database::migrate_urls(&from, &to).await.or_raise(|| ErrorKind::Command("migrate"))?;
            tracing::info!(
                api_keys = report.api_keys,
                files = report.files,
                hotlinks = report.hotlinks,
                end_to_end_info = report.end_to_end_info,
                "Migration complete"
            );
        },
        Command::Upgrade { database } => {
            let db = open_configured(&config, database.as_deref()).await?;
            let result = db.upgrade().await;
            db.close().await;
            let report = result.or_raise(|| ErrorKind::Command("upgrade"))?;
            if report.is_noop() {
                tracing::info!(version = report.to, "Schema already current");
            } else {
                tracing::info!(from = report.from, to = report.to, "Schema upgraded");
            }
        },
        Command::Gc { database, watch: false } => {
            let db = open_configured(&config, database.as_deref()).await?;
            let result = db.run_garbage_collection().await;
            db.close().await;
            let stats = result.or_raise(|| ErrorKind::Command("gc"))?;
            tracing::info!(%stats, "Collection complete");
        },
        Command::Gc { database, watch: true } => {
            let db = open_configured(&config, database.as_deref()).await?;
            let interval = config.gc.interval();
            tracing::info!(interval_secs = interval.as_secs(), "Collecting until interrupted");
            let collector = tokio::spawn(gc::collect_periodically(db.clone(), interval));
            let signal = tokio::signal::ctrl_c().await;
            collector.abort();
            db.close().await;
            signal.or_raise(|| ErrorKind::Command("gc"))?;
        },
        Command::Info { database } => {
            let db = open_configured(&config, database.as_deref()).await?;
            let stored = db.get_db_version().await;
            let backend = db.backend_name().to_string();
            let current = db.get_schema_version();
            db.close().await;
            let stored = stored.or_raise(|| ErrorKind::Command("info"))?;
            println!("backend:        {backend}");
            println!("stored schema:  {stored}");
            println!("current schema: {current}");
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        },
    }
}
