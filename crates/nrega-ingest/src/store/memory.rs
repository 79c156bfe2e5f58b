//! In-process record store
//!
//! Backs dry runs and tests. Every operation takes the map lock once, so each
//! call is atomic like its PostgreSQL counterpart.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{Page, RecordFilter, RecordStore};
use crate::error::StorageError;
use crate::models::{CanonicalRecord, IdentityKey, StoredRecord};

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<IdentityKey, StoredRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every stored record, ordered by key
    pub async fn snapshot(&self) -> Vec<StoredRecord> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.record.key.cmp(&b.record.key));
        records
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn find_by_key(&self, key: &IdentityKey) -> Result<Option<StoredRecord>, StorageError> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn insert(&self, record: &CanonicalRecord) -> Result<(), StorageError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.key) {
            return Err(StorageError::DuplicateKey(record.key.to_string()));
        }

        let now = Utc::now();
        records.insert(
            record.key.clone(),
            StoredRecord {
                id: Uuid::new_v4(),
                record: record.clone(),
                created_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn replace(&self, key: &IdentityKey, record: &CanonicalRecord) -> Result<(), StorageError> {
        let mut records = self.records.write().await;
        let stored = records
            .get_mut(key)
            .ok_or_else(|| StorageError::Permanent(format!("no record to replace at {}", key)))?;

        stored.record = CanonicalRecord {
            key: key.clone(),
            ..record.clone()
        };
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn count(&self, filter: &RecordFilter) -> Result<u64, StorageError> {
        let records = self.records.read().await;
        Ok(records.keys().filter(|key| filter.matches(key)).count() as u64)
    }

    async fn list(&self, filter: &RecordFilter, page: Page) -> Result<Vec<StoredRecord>, StorageError> {
        let records = self.records.read().await;
        let mut matching: Vec<_> = records
            .values()
            .filter(|stored| filter.matches(&stored.record.key))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.record.key.cmp(&b.record.key))
        });

        Ok(matching
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit as usize)
            .collect())
    }
}
