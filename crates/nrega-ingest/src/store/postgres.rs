//! PostgreSQL record store
//!
//! One row per identity key in `mgnrega_records`. The table's UNIQUE
//! constraint over the identity columns backs the one-record-per-key
//! invariant; absent block/panchayat are stored as `''` so the constraint
//! applies to them too.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use super::{Page, RecordFilter, RecordStore};
use crate::error::StorageError;
use crate::models::{CanonicalRecord, IdentityKey, Measures, StoredRecord};

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/mgnrega";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

const SELECT_COLUMNS: &str = r#"
    id, state, district, block, panchayat, financial_year,
    total_works, completed_works, ongoing_works,
    total_job_cards, active_workers, total_person_days,
    total_expenditure, wage_expenditure, material_expenditure,
    data_source, last_updated, created_at, updated_at
"#;

/// Connection settings for [`PgRecordStore`]
#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout: Duration,
}

impl Default for PgStoreConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            connect_timeout: Duration::from_secs(DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &PgStoreConfig) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout)
            .connect(&config.url)
            .await?;

        info!(max_connections = config.max_connections, "Database connection pool established");
        Ok(Self { pool })
    }

    /// Apply the embedded SQL migrations
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Permanent(format!("failed to run migrations: {}", e)))?;

        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    id: Uuid,
    state: String,
    district: String,
    block: String,
    panchayat: String,
    financial_year: String,
    total_works: i64,
    completed_works: i64,
    ongoing_works: i64,
    total_job_cards: i64,
    active_workers: i64,
    total_person_days: i64,
    total_expenditure: f64,
    wage_expenditure: f64,
    material_expenditure: f64,
    data_source: String,
    last_updated: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RecordRow> for StoredRecord {
    type Error = StorageError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        let measures = Measures {
            total_works: from_db(row.total_works)?,
            completed_works: from_db(row.completed_works)?,
            ongoing_works: from_db(row.ongoing_works)?,
            total_job_cards: from_db(row.total_job_cards)?,
            active_workers: from_db(row.active_workers)?,
            total_person_days: from_db(row.total_person_days)?,
            total_expenditure: row.total_expenditure,
            wage_expenditure: row.wage_expenditure,
            material_expenditure: row.material_expenditure,
        };

        Ok(StoredRecord {
            id: row.id,
            record: CanonicalRecord {
                key: IdentityKey {
                    state: row.state,
                    district: row.district,
                    block: row.block,
                    panchayat: row.panchayat,
                    financial_year: row.financial_year,
                },
                measures,
                data_source: row.data_source,
                last_updated: row.last_updated,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn from_db(value: i64) -> Result<u64, StorageError> {
    u64::try_from(value)
        .map_err(|_| StorageError::Permanent(format!("negative count {} in stored record", value)))
}

fn to_db(value: u64) -> Result<i64, StorageError> {
    i64::try_from(value)
        .map_err(|_| StorageError::Permanent(format!("count {} exceeds column range", value)))
}

/// Counts in column order, converted for binding
fn counts(measures: &Measures) -> Result<[i64; 6], StorageError> {
    Ok([
        to_db(measures.total_works)?,
        to_db(measures.completed_works)?,
        to_db(measures.ongoing_works)?,
        to_db(measures.total_job_cards)?,
        to_db(measures.active_workers)?,
        to_db(measures.total_person_days)?,
    ])
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn find_by_key(&self, key: &IdentityKey) -> Result<Option<StoredRecord>, StorageError> {
        let sql = format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM mgnrega_records
            WHERE state = $1 AND district = $2 AND block = $3
              AND panchayat = $4 AND financial_year = $5
            "#
        );

        let row: Option<RecordRow> = sqlx::query_as(&sql)
            .bind(&key.state)
            .bind(&key.district)
            .bind(&key.block)
            .bind(&key.panchayat)
            .bind(&key.financial_year)
            .fetch_optional(&self.pool)
            .await?;

        row.map(StoredRecord::try_from).transpose()
    }

    async fn insert(&self, record: &CanonicalRecord) -> Result<(), StorageError> {
        let [total_works, completed_works, ongoing_works, total_job_cards, active_workers, total_person_days] =
            counts(&record.measures)?;

        sqlx::query(
            r#"
            INSERT INTO mgnrega_records (
                id, state, district, block, panchayat, financial_year,
                total_works, completed_works, ongoing_works,
                total_job_cards, active_workers, total_person_days,
                total_expenditure, wage_expenditure, material_expenditure,
                data_source, last_updated
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&record.key.state)
        .bind(&record.key.district)
        .bind(&record.key.block)
        .bind(&record.key.panchayat)
        .bind(&record.key.financial_year)
        .bind(total_works)
        .bind(completed_works)
        .bind(ongoing_works)
        .bind(total_job_cards)
        .bind(active_workers)
        .bind(total_person_days)
        .bind(record.measures.total_expenditure)
        .bind(record.measures.wage_expenditure)
        .bind(record.measures.material_expenditure)
        .bind(&record.data_source)
        .bind(record.last_updated)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn replace(&self, key: &IdentityKey, record: &CanonicalRecord) -> Result<(), StorageError> {
        let [total_works, completed_works, ongoing_works, total_job_cards, active_workers, total_person_days] =
            counts(&record.measures)?;

        let result = sqlx::query(
            r#"
            UPDATE mgnrega_records
            SET total_works = $6,
                completed_works = $7,
                ongoing_works = $8,
                total_job_cards = $9,
                active_workers = $10,
                total_person_days = $11,
                total_expenditure = $12,
                wage_expenditure = $13,
                material_expenditure = $14,
                data_source = $15,
                last_updated = $16,
                updated_at = NOW()
            WHERE state = $1 AND district = $2 AND block = $3
              AND panchayat = $4 AND financial_year = $5
            "#,
        )
        .bind(&key.state)
        .bind(&key.district)
        .bind(&key.block)
        .bind(&key.panchayat)
        .bind(&key.financial_year)
        .bind(total_works)
        .bind(completed_works)
        .bind(ongoing_works)
        .bind(total_job_cards)
        .bind(active_workers)
        .bind(total_person_days)
        .bind(record.measures.total_expenditure)
        .bind(record.measures.wage_expenditure)
        .bind(record.measures.material_expenditure)
        .bind(&record.data_source)
        .bind(record.last_updated)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Permanent(format!("no record to replace at {}", key)));
        }
        Ok(())
    }

    async fn count(&self, filter: &RecordFilter) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM mgnrega_records
            WHERE ($1::text IS NULL OR state = $1)
              AND ($2::text IS NULL OR district = $2)
              AND ($3::text IS NULL OR financial_year = $3)
            "#,
        )
        .bind(filter.state.as_deref())
        .bind(filter.district.as_deref())
        .bind(filter.financial_year.as_deref())
        .fetch_one(&self.pool)
        .await?;

        from_db(count)
    }

    async fn list(&self, filter: &RecordFilter, page: Page) -> Result<Vec<StoredRecord>, StorageError> {
        let sql = format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM mgnrega_records
            WHERE ($1::text IS NULL OR state = $1)
              AND ($2::text IS NULL OR district = $2)
              AND ($3::text IS NULL OR financial_year = $3)
            ORDER BY updated_at DESC, state, district, block, panchayat, financial_year
            LIMIT $4 OFFSET $5
            "#
        );

        let offset = i64::try_from(page.offset())
            .map_err(|_| StorageError::Permanent("page offset out of range".to_string()))?;

        let rows: Vec<RecordRow> = sqlx::query_as(&sql)
            .bind(filter.state.as_deref())
            .bind(filter.district.as_deref())
            .bind(filter.financial_year.as_deref())
            .bind(i64::from(page.limit))
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(StoredRecord::try_from).collect()
    }
}
