use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use gcf_core::RecordQuery;
use gcf_storage::RecordStore;
use gcf_sync::{open_store, GcfConfig, Scheduler, SyncPipeline};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gcf")]
#[command(about = "Government contract opportunity and award fetcher")]
struct Cli {
    /// Fallback tracing filter when RUST_LOG is unset.
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once and print the run summary.
    Sync,
    /// Create or upgrade the database schema.
    Migrate {
        #[arg(long, env = "DB_FILE", default_value = "./contract_data.db")]
        db: PathBuf,
    },
    /// Start the scheduler and the HTTP query surface.
    Serve,
    /// Print stored records as JSON.
    Query {
        #[arg(value_enum)]
        kind: QueryKind,
        #[arg(long)]
        keyword: Option<String>,
        #[arg(long)]
        naics: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long, env = "DB_FILE", default_value = "./contract_data.db")]
        db: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum QueryKind {
    Opportunities,
    Awards,
}

fn fallback_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_new(log_level.trim().to_ascii_lowercase())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback_filter(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = gcf_sync::run_sync_once_from_env().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Migrate { db } => {
            let store = RecordStore::open(&db)
                .await
                .with_context(|| format!("migrating {}", db.display()))?;
            store.close().await;
            println!("schema up to date: {}", db.display());
        }
        Commands::Serve => serve().await?,
        Commands::Query {
            kind,
            keyword,
            naics,
            limit,
            db,
        } => {
            let store = RecordStore::open(&db).await?;
            let query = RecordQuery {
                keyword,
                classification_code: naics,
                limit,
            };
            let json = match kind {
                QueryKind::Opportunities => {
                    serde_json::to_string_pretty(&store.query_opportunities(&query).await?)?
                }
                QueryKind::Awards => {
                    serde_json::to_string_pretty(&store.query_awards(&query).await?)?
                }
            };
            store.close().await;
            println!("{json}");
        }
    }

    Ok(())
}

async fn serve() -> Result<()> {
    let config = GcfConfig::from_env().context("loading configuration")?;
    let store = open_store(&config).await?;

    let pipeline = Arc::new(SyncPipeline::new(&config, store.clone())?);
    let mut scheduler = Scheduler::new(pipeline, config.schedule.clone());
    scheduler.start(config.run_on_start).await?;

    let served = gcf_web::serve(store.clone(), config.port, shutdown_signal()).await;

    info!("shutting down");
    scheduler.shutdown().await?;
    store.close().await;
    served
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c; serving until killed");
        std::future::pending::<()>().await;
    }
}
