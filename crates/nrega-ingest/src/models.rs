//! Core types for MGNREGA ingestion
//!
//! `CanonicalRecord` is what the normalizer produces and the store persists.
//! `IngestionRun` and `RunReport` live only for the duration of one run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::ValidationError;

/// Default provenance tag for ingested records
pub const DEFAULT_DATA_SOURCE: &str = "MGNREGA API";

/// Natural key of a statistics row
///
/// `block` and `panchayat` use the empty string as the absent marker, so a
/// district-level row and a row with a blank block are the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub state: String,
    pub district: String,
    #[serde(default)]
    pub block: String,
    #[serde(default)]
    pub panchayat: String,
    pub financial_year: String,
}

impl IdentityKey {
    /// District-level key (no block, no panchayat)
    pub fn district_level(
        state: impl Into<String>,
        district: impl Into<String>,
        financial_year: impl Into<String>,
    ) -> Self {
        Self {
            state: state.into(),
            district: district.into(),
            block: String::new(),
            panchayat: String::new(),
            financial_year: financial_year.into(),
        }
    }

    pub fn with_block(mut self, block: impl Into<String>) -> Self {
        self.block = block.into();
        self
    }

    pub fn with_panchayat(mut self, panchayat: impl Into<String>) -> Self {
        self.panchayat = panchayat.into();
        self
    }

    pub fn block(&self) -> Option<&str> {
        (!self.block.is_empty()).then_some(self.block.as_str())
    }

    pub fn panchayat(&self) -> Option<&str> {
        (!self.panchayat.is_empty()).then_some(self.panchayat.as_str())
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.state, self.district)?;
        if let Some(block) = self.block() {
            write!(f, "/{}", block)?;
        }
        if let Some(panchayat) = self.panchayat() {
            write!(f, "/{}", panchayat)?;
        }
        write!(f, "@{}", self.financial_year)
    }
}

/// Works, employment and expenditure measures
///
/// `total_works >= completed_works + ongoing_works` is not enforced: upstream
/// figures are known to over- and under-count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Measures {
    pub total_works: u64,
    pub completed_works: u64,
    pub ongoing_works: u64,
    pub total_job_cards: u64,
    pub active_workers: u64,
    pub total_person_days: u64,
    pub total_expenditure: f64,
    pub wage_expenditure: f64,
    pub material_expenditure: f64,
}

/// One normalized row of ingested statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub key: IdentityKey,
    pub measures: Measures,
    pub data_source: String,
    /// Start time of the ingestion run that produced this value
    pub last_updated: DateTime<Utc>,
}

impl CanonicalRecord {
    pub fn new(key: IdentityKey, measures: Measures, last_updated: DateTime<Utc>) -> Self {
        Self {
            key,
            measures,
            data_source: DEFAULT_DATA_SOURCE.to_string(),
            last_updated,
        }
    }

    pub fn with_data_source(mut self, data_source: impl Into<String>) -> Self {
        self.data_source = data_source.into();
        self
    }
}

/// A record as held by the store, with storage-owned lifecycle fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: Uuid,
    pub record: CanonicalRecord,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Raw upstream response body
#[derive(Debug, Clone)]
pub struct RawPayload {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl RawPayload {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            content_type: None,
            fetched_at: Utc::now(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// An upstream entry excluded from the batch
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRecord {
    /// Position of the entry in the payload
    pub index: usize,
    pub raw_fragment: String,
    pub reason: ValidationError,
}

/// What caused a run to start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Scheduled,
    Manual,
    Retry,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Scheduled => "scheduled",
            RunTrigger::Manual => "manual",
            RunTrigger::Retry => "retry",
        }
    }
}

/// Pipeline stage a run has reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Pending,
    Fetching,
    Normalizing,
    Upserting,
    Finished,
}

/// Result of one ingestion run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Partial { failed: usize, total: usize },
    Failure { reason: String },
    Cancelled,
}

impl RunOutcome {
    pub fn failure(reason: impl fmt::Display) -> Self {
        RunOutcome::Failure {
            reason: reason.to_string(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, RunOutcome::Failure { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Partial { .. } => "partial",
            RunOutcome::Failure { .. } => "failure",
            RunOutcome::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Success => write!(f, "success"),
            RunOutcome::Partial { failed, total } => {
                write!(f, "partial ({} of {} records failed)", failed, total)
            },
            RunOutcome::Failure { reason } => write!(f, "failure: {}", reason),
            RunOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One execution of the pipeline, owned by whoever started it
#[derive(Debug, Clone)]
pub struct IngestionRun {
    pub run_id: Uuid,
    pub trigger: RunTrigger,
    pub started_at: DateTime<Utc>,
    /// 1-based attempt number within the current backoff cycle
    pub attempt: u32,
    pub stage: RunStage,
    pub outcome: Option<RunOutcome>,
}

impl IngestionRun {
    pub fn new(trigger: RunTrigger, attempt: u32) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            trigger,
            started_at: Utc::now(),
            attempt,
            stage: RunStage::Pending,
            outcome: None,
        }
    }
}

/// Counters gathered while a run executes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Entries found in the payload, valid or not
    pub records_total: usize,
    /// Rejected, failed and skipped entries
    pub records_failed: usize,
    pub rejected: usize,
    pub inserted: usize,
    pub replaced: usize,
    pub storage_failed: usize,
    /// Valid records never attempted (cancellation or short-circuit)
    pub skipped: usize,
}

impl RunReport {
    pub fn upserted(&self) -> usize {
        self.inserted + self.replaced
    }
}

/// Structured event emitted once per finished run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunEvent {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub trigger: RunTrigger,
    pub outcome: RunOutcome,
    pub records_total: usize,
    pub records_failed: usize,
    pub attempt: u32,
}

impl RunEvent {
    pub fn from_run(run: &IngestionRun, report: &RunReport) -> Self {
        Self {
            run_id: run.run_id,
            timestamp: Utc::now(),
            trigger: run.trigger,
            outcome: run.outcome.clone().unwrap_or(RunOutcome::Cancelled),
            records_total: report.records_total,
            records_failed: report.records_failed,
            attempt: run.attempt,
        }
    }
}
