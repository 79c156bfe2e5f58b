//! PostgreSQL store tests
//!
//! Require Docker; run with `cargo test -- --ignored`.

mod common;

use anyhow::{Context, Result};
use chrono::Utc;
use common::{district_key, init_tracing};
use nrega_ingest::{
    CanonicalRecord, Measures, Page, PgRecordStore, PgStoreConfig, RecordFilter, RecordStore,
    StorageError, UpsertAction, Upserter,
};
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio_util::sync::CancellationToken;

async fn start_store() -> Result<(ContainerAsync<Postgres>, PgRecordStore)> {
    let container = Postgres::default()
        .with_tag("16-alpine")
        .start()
        .await
        .context("Failed to start PostgreSQL container")?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432.tcp()).await?;

    let store = PgRecordStore::connect(&PgStoreConfig {
        url: format!("postgresql://postgres:postgres@{}:{}/postgres", host, port),
        max_connections: 5,
        connect_timeout: Duration::from_secs(10),
    })
    .await?;
    store.migrate().await?;

    Ok((container, store))
}

fn record(district: &str, total_works: u64) -> CanonicalRecord {
    CanonicalRecord::new(
        district_key(district),
        Measures {
            total_works,
            total_expenditure: 1250.75,
            ..Default::default()
        },
        Utc::now(),
    )
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_insert_find_and_replace() -> Result<()> {
    init_tracing();
    let (_container, store) = start_store().await?;

    store.insert(&record("Patna", 10)).await?;
    let before = store
        .find_by_key(&district_key("Patna"))
        .await?
        .context("inserted record not found")?;
    assert_eq!(before.record.measures.total_works, 10);
    assert_eq!(before.record.measures.total_expenditure, 1250.75);

    store.replace(&district_key("Patna"), &record("Patna", 5)).await?;
    let after = store
        .find_by_key(&district_key("Patna"))
        .await?
        .context("replaced record not found")?;

    assert_eq!(after.id, before.id);
    assert_eq!(after.created_at, before.created_at);
    assert_eq!(after.record.measures.total_works, 5);
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_unique_identity_key_is_enforced() -> Result<()> {
    init_tracing();
    let (_container, store) = start_store().await?;

    store.insert(&record("Gaya", 1)).await?;
    let err = store.insert(&record("Gaya", 2)).await.unwrap_err();
    assert!(matches!(err, StorageError::DuplicateKey(_)), "got {:?}", err);

    let missing = store.replace(&district_key("Arwal"), &record("Arwal", 1)).await;
    assert!(missing.unwrap_err().is_permanent());
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_upserter_is_idempotent_against_postgres() -> Result<()> {
    init_tracing();
    let (_container, store) = start_store().await?;
    let store = Arc::new(store);
    let upserter = Upserter::new(store.clone());

    let batch = || vec![record("Patna", 3), record("Gaya", 4), record("Patna", 7)];
    let first = upserter.upsert_batch(batch(), &CancellationToken::new()).await;
    let second = upserter.upsert_batch(batch(), &CancellationToken::new()).await;

    assert_eq!(first.failed + second.failed, 0);
    assert_eq!(store.count(&RecordFilter::default()).await?, 2);

    let patna = store
        .find_by_key(&district_key("Patna"))
        .await?
        .context("record not found")?;
    assert_eq!(patna.record.measures.total_works, 7);

    let action = upserter.upsert(&record("Saran", 1)).await?;
    assert_eq!(action, UpsertAction::Inserted);
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_count_and_list_filters() -> Result<()> {
    init_tracing();
    let (_container, store) = start_store().await?;

    for district in ["Patna", "Gaya", "Nalanda"] {
        store.insert(&record(district, 1)).await?;
    }
    let mut other = record("Pune", 1);
    other.key.state = "Maharashtra".to_string();
    store.insert(&other).await?;

    let bihar = RecordFilter::default().state("Bihar");
    assert_eq!(store.count(&bihar).await?, 3);
    assert_eq!(store.count(&bihar.clone().district("Gaya")).await?, 1);

    let page = store.list(&bihar, Page::new(1, 2)).await?;
    assert_eq!(page.len(), 2);
    assert!(page[0].updated_at >= page[1].updated_at);
    Ok(())
}
