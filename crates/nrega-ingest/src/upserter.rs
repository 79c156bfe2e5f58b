//! Idempotent merge of canonical records into the store
//!
//! A record is inserted when its key is new and fully replaced otherwise, so
//! re-ingesting an unchanged snapshot leaves the store as it was.
//!
//! Batches are split into shards by key hash. Shards run concurrently; within
//! a shard records are written one at a time in payload order, which keeps
//! writes to the same key serialized and makes the last occurrence in the
//! batch win.

use futures::future::join_all;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::StorageError;
use crate::models::{CanonicalRecord, IdentityKey};
use crate::store::RecordStore;

/// Default number of concurrent upsert shards
pub const DEFAULT_UPSERT_WORKERS: usize = 4;

/// Default number of consecutive failures that marks the store as down and aborts a batch
pub const DEFAULT_SHORT_CIRCUIT_THRESHOLD: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    Inserted,
    Replaced,
}

/// Per-batch result counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub replaced: usize,
    pub failed: usize,
    /// Records never attempted
    pub skipped: usize,
    pub cancelled: bool,
    pub short_circuited: bool,
    pub last_error: Option<StorageError>,
}

impl UpsertSummary {
    pub fn succeeded(&self) -> usize {
        self.inserted + self.replaced
    }

    fn absorb(&mut self, tally: ShardTally) {
        self.inserted += tally.inserted;
        self.replaced += tally.replaced;
        self.failed += tally.failed;
        self.skipped += tally.skipped;
        if tally.last_error.is_some() {
            self.last_error = tally.last_error;
        }
    }
}

#[derive(Debug, Default)]
struct ShardTally {
    inserted: usize,
    replaced: usize,
    failed: usize,
    skipped: usize,
    last_error: Option<StorageError>,
}

/// Tracks consecutive permanent or unavailable failures across shards
struct FailureTracker {
    consecutive_fatal: AtomicUsize,
    threshold: usize,
    tripped: AtomicBool,
}

impl FailureTracker {
    fn new(threshold: usize) -> Self {
        Self {
            consecutive_fatal: AtomicUsize::new(0),
            threshold,
            tripped: AtomicBool::new(false),
        }
    }

    fn record_success(&self) {
        self.consecutive_fatal.store(0, Ordering::Relaxed);
    }

    /// Returns true when the batch should stop
    fn record_failure(&self, err: &StorageError) -> bool {
        if self.threshold == 0 || !err.dooms_batch() {
            return false;
        }
        let seen = self.consecutive_fatal.fetch_add(1, Ordering::Relaxed) + 1;
        if seen >= self.threshold {
            self.tripped.store(true, Ordering::Relaxed);
            return true;
        }
        false
    }
}

pub struct Upserter {
    store: Arc<dyn RecordStore>,
    workers: usize,
    short_circuit_after: usize,
}

impl Upserter {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            workers: DEFAULT_UPSERT_WORKERS,
            short_circuit_after: DEFAULT_SHORT_CIRCUIT_THRESHOLD,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// `0` disables short-circuiting
    pub fn with_short_circuit_after(mut self, failures: usize) -> Self {
        self.short_circuit_after = failures;
        self
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Merge one record by its identity key
    pub async fn upsert(&self, record: &CanonicalRecord) -> Result<UpsertAction, StorageError> {
        if self.store.find_by_key(&record.key).await?.is_some() {
            self.store.replace(&record.key, record).await?;
            return Ok(UpsertAction::Replaced);
        }

        match self.store.insert(record).await {
            Ok(()) => Ok(UpsertAction::Inserted),
            Err(StorageError::DuplicateKey(_)) => {
                // another writer created the key between find and insert
                debug!(key = %record.key, "Insert raced with another writer, replacing");
                self.store.replace(&record.key, record).await?;
                Ok(UpsertAction::Replaced)
            },
            Err(e) => Err(e),
        }
    }

    /// Merge a batch; individual failures never stop sibling records
    ///
    /// `cancel` is checked before each record. A store call already in flight
    /// is always awaited.
    pub async fn upsert_batch(
        &self,
        records: Vec<CanonicalRecord>,
        cancel: &CancellationToken,
    ) -> UpsertSummary {
        let mut summary = UpsertSummary::default();
        if records.is_empty() {
            return summary;
        }

        let abort = cancel.child_token();
        let tracker = FailureTracker::new(self.short_circuit_after);
        let shards = shard(records, self.workers);

        debug!(shards = shards.len(), "Upserting batch");

        let tallies = join_all(
            shards
                .into_iter()
                .map(|records| self.run_shard(records, &abort, &tracker)),
        )
        .await;

        for tally in tallies {
            summary.absorb(tally);
        }

        summary.cancelled = cancel.is_cancelled();
        summary.short_circuited = tracker.tripped.load(Ordering::Relaxed);

        if summary.short_circuited {
            error!(
                failed = summary.failed,
                skipped = summary.skipped,
                "Store appears unavailable, remaining upserts abandoned"
            );
        }

        summary
    }

    async fn run_shard(
        &self,
        records: Vec<CanonicalRecord>,
        abort: &CancellationToken,
        tracker: &FailureTracker,
    ) -> ShardTally {
        let mut tally = ShardTally::default();
        let total = records.len();

        for (attempted, record) in records.into_iter().enumerate() {
            if abort.is_cancelled() {
                tally.skipped = total - attempted;
                break;
            }

            match self.upsert(&record).await {
                Ok(UpsertAction::Inserted) => {
                    tally.inserted += 1;
                    tracker.record_success();
                },
                Ok(UpsertAction::Replaced) => {
                    tally.replaced += 1;
                    tracker.record_success();
                },
                Err(e) => {
                    warn!(key = %record.key, error = %e, "Upsert failed");
                    tally.failed += 1;
                    if tracker.record_failure(&e) {
                        abort.cancel();
                    }
                    tally.last_error = Some(e);
                },
            }
        }

        tally
    }
}

/// Partition by key hash, preserving input order within each shard
fn shard(records: Vec<CanonicalRecord>, workers: usize) -> Vec<Vec<CanonicalRecord>> {
    let workers = workers.clamp(1, records.len().max(1));
    let mut shards: Vec<Vec<CanonicalRecord>> = (0..workers).map(|_| Vec::new()).collect();

    for record in records {
        shards[shard_index(&record.key, workers)].push(record);
    }

    shards.retain(|s| !s.is_empty());
    shards
}

fn shard_index(key: &IdentityKey, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}
