//! MGNREGA Ingest - scheduled statistics ingestion

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nrega_common::logging::{init_logging, LogConfig};
use nrega_ingest::{
    HttpFetcher, IngestConfig, IngestPipeline, IngestionRun, MemoryRecordStore, Normalizer,
    PgRecordStore, RecordFilter, RecordStore, RunTrigger, Scheduler, Upserter,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

#[derive(Parser, Debug)]
#[command(name = "nrega-ingest")]
#[command(author, version, about = "MGNREGA statistics ingestion service")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one ingestion now
    Run {
        /// Write into an in-memory store instead of PostgreSQL
        #[arg(long)]
        dry_run: bool,
    },

    /// Run ingestion on the configured schedule until Ctrl-C
    Schedule,

    /// Print the number of stored records
    Stats {
        #[arg(long)]
        state: Option<String>,

        #[arg(long)]
        district: Option<String>,
    },

    /// Apply database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    // environment variables take precedence
    let log_config = LogConfig::new("nrega-ingest").with_level(log_level).merge_env()?;
    let _log_guard = init_logging(&log_config)?;

    let config = IngestConfig::from_env().context("failed to load ingestion configuration")?;

    match cli.command {
        Command::Run { dry_run } => run_once(&config, dry_run).await,
        Command::Schedule => schedule(&config).await,
        Command::Stats { state, district } => stats(&config, state, district).await,
        Command::Migrate => {
            let store = connect(&config).await?;
            store.migrate().await?;
            Ok(())
        },
    }
}

async fn connect(config: &IngestConfig) -> Result<PgRecordStore> {
    PgRecordStore::connect(&config.pg_config())
        .await
        .context("failed to connect to database")
}

fn build_pipeline(config: &IngestConfig, store: Arc<dyn RecordStore>) -> Result<IngestPipeline> {
    let fetcher = HttpFetcher::new(config.fetcher_config())?;
    let upserter = Upserter::new(store)
        .with_workers(config.upsert_workers)
        .with_short_circuit_after(config.short_circuit_threshold);

    Ok(IngestPipeline::new(
        Arc::new(fetcher),
        Normalizer::new(&config.data_source),
        upserter,
    ))
}

async fn run_once(config: &IngestConfig, dry_run: bool) -> Result<()> {
    let store: Arc<dyn RecordStore> = if dry_run {
        info!("Dry run, records are kept in memory");
        Arc::new(MemoryRecordStore::new())
    } else {
        Arc::new(connect(config).await?)
    };

    let pipeline = build_pipeline(config, store)?;
    let cancel = CancellationToken::new();

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            shutdown.cancel();
        }
    });

    let (run, report) = pipeline
        .execute(IngestionRun::new(RunTrigger::Manual, 1), cancel)
        .await;

    println!("{}", serde_json::to_string_pretty(&report)?);

    match run.outcome {
        Some(outcome) if outcome.is_failure() => anyhow::bail!("ingestion {}", outcome),
        _ => Ok(()),
    }
}

async fn schedule(config: &IngestConfig) -> Result<()> {
    let store = connect(config).await?;
    store.migrate().await?;

    let pipeline = build_pipeline(config, Arc::new(store))?;
    let mut handle = Scheduler::new(Arc::new(pipeline), config.scheduler_config()?).start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    handle.stop().await;
    Ok(())
}

async fn stats(config: &IngestConfig, state: Option<String>, district: Option<String>) -> Result<()> {
    let store = connect(config).await?;

    let filter = RecordFilter {
        state,
        district,
        financial_year: None,
    };
    let total = store.count(&filter).await?;

    println!("{}", serde_json::json!({ "totalRecords": total }));
    Ok(())
}
