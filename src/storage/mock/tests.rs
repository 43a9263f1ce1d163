use chrono::{TimeZone, Utc};

use super::*;
use crate::interfaces::{StagingTable, StorageError, UsageStore};
use crate::record::{FactRow, StagingRow, UsageRecord};

fn record(customer: i32) -> UsageRecord {
    UsageRecord {
        customer_id: Some(customer),
        event_start_time: Some(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()),
        event_type: Some("SMS".to_string()),
        ..UsageRecord::default()
    }
}

#[tokio::test]
async fn test_mock_staging_is_invisible_until_finish() {
    let store = MockUsageStore::new();
    let table = StagingTable::for_run("m1").unwrap();
    store.create_staging(&table).await.unwrap();

    let mut writer = store.open_staging_writer(&table).await.unwrap();
    writer
        .write(&[StagingRow { seq: 1, record: record(1) }])
        .await
        .unwrap();
    assert!(store.staged_rows(&table).await.is_empty());
    assert_eq!(writer.finish().await.unwrap(), 1);
    assert_eq!(store.staged_rows(&table).await.len(), 1);

    store.drop_staging(&table).await.unwrap();
    assert!(store.staging_tables().await.is_empty());
}

#[tokio::test]
async fn test_mock_writer_requires_staging_table() {
    let store = MockUsageStore::new();
    let table = StagingTable::for_run("missing").unwrap();
    let result = store.open_staging_writer(&table).await;
    assert!(matches!(result, Err(StorageError::StagingNotFound(_))));
}

#[tokio::test]
async fn test_mock_merge_rollback_discards_changes() {
    let store = MockUsageStore::new();
    store.ensure_schema().await.unwrap();
    let indexes = store.indexes().await;
    assert_eq!(indexes.len(), crate::storage::schema::SECONDARY_INDEXES.len());

    let loaded_at = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
    let mut tx = store.begin_merge().await.unwrap();
    tx.drop_index(&indexes[0].name).await.unwrap();
    assert_eq!(
        tx.insert_or_ignore(&[FactRow::from_record(record(1), loaded_at)])
            .await
            .unwrap(),
        1
    );
    tx.rollback().await.unwrap();

    assert_eq!(store.indexes().await, indexes);
    assert_eq!(store.fact_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_mock_merge_commit_publishes_changes() {
    let store = MockUsageStore::new();
    let loaded_at = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
    let row = FactRow::from_record(record(1), loaded_at);

    let mut tx = store.begin_merge().await.unwrap();
    assert_eq!(tx.insert_or_ignore(&[row.clone(), row.clone()]).await.unwrap(), 1);
    tx.commit().await.unwrap();

    assert_eq!(store.facts().await, vec![row]);
}

#[tokio::test]
async fn test_mock_fetch_staged_pages_by_seq() {
    let store = MockUsageStore::new();
    let table = StagingTable::for_run("pages").unwrap();
    store.create_staging(&table).await.unwrap();
    let mut writer = store.open_staging_writer(&table).await.unwrap();
    let rows: Vec<StagingRow> = (1..=5)
        .map(|seq| StagingRow {
            seq,
            record: record(seq as i32),
        })
        .collect();
    writer.write(&rows).await.unwrap();
    writer.finish().await.unwrap();

    let mut tx = store.begin_merge().await.unwrap();
    let page = tx.fetch_staged(&table, 2, 2).await.unwrap();
    assert_eq!(page.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![3, 4]);
    assert!(tx.fetch_staged(&table, 5, 2).await.unwrap().is_empty());
    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn test_mock_failure_flags() {
    let store = MockUsageStore::new();
    let now = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();

    store.set_fail_on_quality(true).await;
    assert!(store.critical_null_counts(now).await.is_err());
    assert!(store.future_dated_count(now).await.is_err());

    store.set_fail_on_delete(true).await;
    assert!(store.delete_older_than(now).await.is_err());

    store.set_fail_on_views(true).await;
    assert!(store.refresh_views().await.is_err());
    assert_eq!(store.views_refreshed().await, 0);
}
