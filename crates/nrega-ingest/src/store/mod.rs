//! Durable record storage
//!
//! The upserter only relies on `find_by_key`, `insert` and `replace`, each
//! atomic per call. `count` and `list` are the read projections that make
//! written records queryable.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::models::{CanonicalRecord, IdentityKey, StoredRecord};

pub mod memory;
pub mod postgres;

pub use memory::MemoryRecordStore;
pub use postgres::{PgRecordStore, PgStoreConfig};

/// Default page size for `list`
pub const DEFAULT_PAGE_LIMIT: u32 = 10;

/// Largest page size `list` will honour
pub const MAX_PAGE_LIMIT: u32 = 500;

/// Equality filter over the query-side fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub state: Option<String>,
    pub district: Option<String>,
    pub financial_year: Option<String>,
}

impl RecordFilter {
    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn district(mut self, district: impl Into<String>) -> Self {
        self.district = Some(district.into());
        self
    }

    pub fn financial_year(mut self, financial_year: impl Into<String>) -> Self {
        self.financial_year = Some(financial_year.into());
        self
    }

    pub fn matches(&self, key: &IdentityKey) -> bool {
        self.state.as_ref().map_or(true, |s| *s == key.state)
            && self.district.as_ref().map_or(true, |d| *d == key.district)
            && self
                .financial_year
                .as_ref()
                .map_or(true, |fy| *fy == key.financial_year)
    }
}

/// 1-based pagination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub limit: u32,
}

impl Page {
    pub fn new(page: u32, limit: u32) -> Self {
        Self {
            page: page.max(1),
            limit: limit.clamp(1, MAX_PAGE_LIMIT),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.limit)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(1, DEFAULT_PAGE_LIMIT)
    }
}

/// Storage contract for canonical records
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find_by_key(&self, key: &IdentityKey) -> Result<Option<StoredRecord>, StorageError>;

    /// Create a record; `DuplicateKey` if the key already exists
    async fn insert(&self, record: &CanonicalRecord) -> Result<(), StorageError>;

    /// Overwrite every measure and metadata field of the record at `key`
    async fn replace(&self, key: &IdentityKey, record: &CanonicalRecord) -> Result<(), StorageError>;

    async fn count(&self, filter: &RecordFilter) -> Result<u64, StorageError>;

    /// Matching records, most recently updated first
    async fn list(&self, filter: &RecordFilter, page: Page) -> Result<Vec<StoredRecord>, StorageError>;
}
