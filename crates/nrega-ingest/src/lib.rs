//! MGNREGA Ingest Library
//!
//! Scheduled ingestion of MGNREGA works, employment and expenditure
//! statistics into a durable record store.
//!
//! # Pipeline
//!
//! - **Fetcher**: one bounded GET against the upstream endpoint
//! - **Normalizer**: per-entry validation into canonical records
//! - **Upserter**: idempotent insert-or-replace by identity key
//! - **Scheduler**: cadence, manual triggers and retry backoff
//!
//! # Example
//!
//! ```no_run
//! use nrega_ingest::{
//!     FetcherConfig, HttpFetcher, IngestPipeline, IngestionRun, MemoryRecordStore, Normalizer,
//!     RunTrigger, Upserter, DEFAULT_DATA_SOURCE,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let fetcher = HttpFetcher::new(FetcherConfig::new("https://example.org/mgnrega.json"))?;
//!     let pipeline = IngestPipeline::new(
//!         Arc::new(fetcher),
//!         Normalizer::new(DEFAULT_DATA_SOURCE),
//!         Upserter::new(Arc::new(MemoryRecordStore::new())),
//!     );
//!
//!     let run = IngestionRun::new(RunTrigger::Manual, 1);
//!     let (run, report) = pipeline.execute(run, CancellationToken::new()).await;
//!     println!("{:?}: {} records", run.outcome, report.records_total);
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod models;
pub mod normalizer;
pub mod pipeline;
pub mod scheduler;
pub mod store;
pub mod upserter;

pub use backoff::BackoffPolicy;
pub use config::IngestConfig;
pub use error::{FetchError, PayloadError, StorageError, ValidationError};
pub use fetcher::{FetcherConfig, HttpFetcher, PayloadSource};
pub use models::{
    CanonicalRecord, IdentityKey, IngestionRun, Measures, RawPayload, RejectedRecord, RunEvent,
    RunOutcome, RunReport, RunStage, RunTrigger, StoredRecord, DEFAULT_DATA_SOURCE,
};
pub use normalizer::{NormalizedBatch, Normalizer};
pub use pipeline::IngestPipeline;
pub use scheduler::{
    Cadence, RunGate, Scheduler, SchedulerConfig, SchedulerHandle, SchedulerState, TriggerResult,
};
pub use store::{MemoryRecordStore, Page, PgRecordStore, PgStoreConfig, RecordFilter, RecordStore};
pub use upserter::{UpsertAction, UpsertSummary, Upserter};
