//! Shared fixtures for ingestion integration tests
//!
//! Scripted payload sources and a fault-injecting store wrapper, so pipeline
//! and scheduler behaviour can be driven without a network or a database.

#![allow(dead_code)]

use async_trait::async_trait;
use nrega_ingest::{
    CanonicalRecord, FetchError, IdentityKey, IngestPipeline, MemoryRecordStore, Normalizer, Page,
    PayloadSource, RawPayload, RecordFilter, RecordStore, StorageError, StoredRecord, Upserter,
    DEFAULT_DATA_SOURCE,
};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,nrega_ingest=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// A district-level upstream entry in the camelCase shape
pub fn entry(district: &str, total_works: u64) -> Value {
    json!({
        "state": "Bihar",
        "district": district,
        "financialYear": "2023-24",
        "totalWorks": total_works,
        "completedWorks": total_works / 2,
        "totalExpenditure": total_works as f64 * 1000.0,
    })
}

pub fn payload(entries: &[Value]) -> String {
    Value::Array(entries.to_vec()).to_string()
}

pub fn district_key(district: &str) -> IdentityKey {
    IdentityKey::district_level("Bihar", district, "2023-24")
}

pub fn pipeline(source: Arc<dyn PayloadSource>, store: Arc<dyn RecordStore>) -> IngestPipeline {
    pipeline_with(source, Upserter::new(store))
}

pub fn pipeline_with(source: Arc<dyn PayloadSource>, upserter: Upserter) -> IngestPipeline {
    IngestPipeline::new(source, Normalizer::new(DEFAULT_DATA_SOURCE), upserter)
}

// ============================================================================
// Payload sources
// ============================================================================

/// Returns the current body on every fetch; the format is sniffed
pub struct StaticSource {
    body: Mutex<String>,
    pub fetches: AtomicUsize,
}

impl StaticSource {
    pub fn new(body: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            body: Mutex::new(body.into()),
            fetches: AtomicUsize::new(0),
        })
    }

    pub fn set_body(&self, body: impl Into<String>) {
        *self.body.lock().unwrap() = body.into();
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PayloadSource for StaticSource {
    async fn fetch(&self) -> Result<RawPayload, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let body = self.body.lock().unwrap().clone();
        Ok(RawPayload::new(body))
    }

    fn describe(&self) -> String {
        "static".to_string()
    }
}

/// Plays back scripted results, then repeats `fallback`
pub struct ScriptedSource {
    script: Mutex<VecDeque<Result<String, FetchError>>>,
    fallback: Result<String, FetchError>,
    pub fetches: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(
        script: Vec<Result<String, FetchError>>,
        fallback: Result<String, FetchError>,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            fetches: AtomicUsize::new(0),
        })
    }

    /// Always fails with `err`
    pub fn failing(err: FetchError) -> Arc<Self> {
        Self::new(Vec::new(), Err(err))
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PayloadSource for ScriptedSource {
    async fn fetch(&self) -> Result<RawPayload, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        next.map(RawPayload::new)
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

/// Holds every fetch open until `release` is called
pub struct BlockingSource {
    body: String,
    started: Notify,
    release: Notify,
    pub fetches: AtomicUsize,
}

impl BlockingSource {
    pub fn new(body: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            body: body.into(),
            started: Notify::new(),
            release: Notify::new(),
            fetches: AtomicUsize::new(0),
        })
    }

    /// Resolves once a fetch is in flight
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PayloadSource for BlockingSource {
    async fn fetch(&self) -> Result<RawPayload, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        self.release.notified().await;
        Ok(RawPayload::new(self.body.clone()))
    }

    fn describe(&self) -> String {
        "blocking".to_string()
    }
}

/// Panics on every fetch
pub struct PanickingSource;

#[async_trait]
impl PayloadSource for PanickingSource {
    async fn fetch(&self) -> Result<RawPayload, FetchError> {
        panic!("upstream client bug");
    }

    fn describe(&self) -> String {
        "panicking".to_string()
    }
}

// ============================================================================
// Fault-injecting store
// ============================================================================

/// In-memory store that fails on demand
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryRecordStore,
    failing_districts: HashMap<String, StorageError>,
    fail_everything: Option<StorageError>,
    cancel_on_insert: Option<CancellationToken>,
    attempts: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every upsert of a record in `district` fails with `err`
    pub fn failing_district(mut self, district: &str, err: StorageError) -> Self {
        self.failing_districts.insert(district.to_string(), err);
        self
    }

    pub fn failing_all(mut self, err: StorageError) -> Self {
        self.fail_everything = Some(err);
        self
    }

    /// Cancel `token` right after the first committed insert
    pub fn cancelling_on_insert(mut self, token: CancellationToken) -> Self {
        self.cancel_on_insert = Some(token);
        self
    }

    /// Upserts attempted so far
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn check(&self, key: &IdentityKey) -> Result<(), StorageError> {
        if let Some(err) = &self.fail_everything {
            return Err(err.clone());
        }
        match self.failing_districts.get(&key.district) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RecordStore for FlakyStore {
    async fn find_by_key(&self, key: &IdentityKey) -> Result<Option<StoredRecord>, StorageError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.check(key)?;
        self.inner.find_by_key(key).await
    }

    async fn insert(&self, record: &CanonicalRecord) -> Result<(), StorageError> {
        self.check(&record.key)?;
        self.inner.insert(record).await?;
        if let Some(token) = &self.cancel_on_insert {
            token.cancel();
        }
        Ok(())
    }

    async fn replace(&self, key: &IdentityKey, record: &CanonicalRecord) -> Result<(), StorageError> {
        self.check(key)?;
        self.inner.replace(key, record).await
    }

    async fn count(&self, filter: &RecordFilter) -> Result<u64, StorageError> {
        self.inner.count(filter).await
    }

    async fn list(&self, filter: &RecordFilter, page: Page) -> Result<Vec<StoredRecord>, StorageError> {
        self.inner.list(filter, page).await
    }
}
