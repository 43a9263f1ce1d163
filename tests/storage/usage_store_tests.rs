//! UsageStore interface tests.
//!
//! These tests verify the contract of the UsageStore trait.
//! Each storage implementation should run these tests. They share one store,
//! so every test uses its own staging table, customer range and timestamps,
//! and asserts on deltas rather than absolute row counts.

use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;

use usage_ingest::interfaces::{StagingTable, UsageStore};
use usage_ingest::record::{FactRow, StagingRow, UsageRecord};
use usage_ingest::storage::schema::SECONDARY_INDEXES;

pub fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

/// Create a fully populated record.
pub fn make_record(customer_id: i32, start: DateTime<Utc>) -> UsageRecord {
    UsageRecord {
        customer_id: Some(customer_id),
        event_start_time: Some(start),
        event_type: Some("VOICE".to_string()),
        rate_plan_id: Some(3),
        billing_flag_one: Some(0),
        billing_flag_two: Some(1),
        duration: Some(42.25),
        charge: Some(Decimal::from_str("1.23456789").unwrap()),
        month: Some(start.format("%Y-%m").to_string()),
    }
}

fn staged(records: Vec<UsageRecord>) -> Vec<StagingRow> {
    records
        .into_iter()
        .enumerate()
        .map(|(i, record)| StagingRow {
            seq: i as i64 + 1,
            record,
        })
        .collect()
}

async fn insert<S: UsageStore>(store: &S, rows: &[FactRow]) -> u64 {
    let mut tx = store.begin_merge().await.expect("begin should succeed");
    let inserted = tx
        .insert_or_ignore(rows)
        .await
        .expect("insert should succeed");
    tx.commit().await.expect("commit should succeed");
    inserted
}

// =============================================================================
// Schema and indexes
// =============================================================================

pub async fn test_schema_is_idempotent<S: UsageStore>(store: &S) {
    store.ensure_schema().await.expect("first ensure should succeed");
    store.ensure_schema().await.expect("second ensure should succeed");

    let names: Vec<String> = store
        .list_secondary_indexes()
        .await
        .expect("list should succeed")
        .into_iter()
        .map(|i| i.name)
        .collect();
    let mut expected: Vec<String> = SECONDARY_INDEXES.iter().map(|(n, _)| n.to_string()).collect();
    expected.sort();
    assert_eq!(names, expected, "catalogued indexes should exist");
}

pub async fn test_index_drop_and_recreate<S: UsageStore>(store: &S) {
    let before = store.list_secondary_indexes().await.unwrap();
    assert!(!before.is_empty());

    let mut tx = store.begin_merge().await.unwrap();
    let captured = tx.secondary_indexes().await.unwrap();
    assert_eq!(captured, before, "transaction should see committed indexes");
    for index in &captured {
        tx.drop_index(&index.name).await.unwrap();
    }
    assert!(tx.secondary_indexes().await.unwrap().is_empty());
    for index in &captured {
        tx.create_index(index).await.unwrap();
    }
    tx.commit().await.unwrap();

    assert_eq!(store.list_secondary_indexes().await.unwrap(), before);
}

pub async fn test_rollback_restores_indexes_and_discards_rows<S: UsageStore>(store: &S) {
    let before_indexes = store.list_secondary_indexes().await.unwrap();
    let before_count = store.fact_count().await.unwrap();

    let mut tx = store.begin_merge().await.unwrap();
    for index in &before_indexes {
        tx.drop_index(&index.name).await.unwrap();
    }
    let row = FactRow::from_record(make_record(10_001, at(2024, 3, 1)), at(2024, 3, 2));
    assert_eq!(tx.insert_or_ignore(&[row]).await.unwrap(), 1);
    tx.rollback().await.unwrap();

    assert_eq!(store.list_secondary_indexes().await.unwrap(), before_indexes);
    assert_eq!(store.fact_count().await.unwrap(), before_count);
}

pub async fn test_ensure_secondary_indexes_recreates_missing<S: UsageStore>(store: &S) {
    let before = store.list_secondary_indexes().await.unwrap();

    let mut tx = store.begin_merge().await.unwrap();
    tx.drop_index(&before[0].name).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(store.list_secondary_indexes().await.unwrap().len(), before.len() - 1);

    store.ensure_secondary_indexes().await.unwrap();
    let names: Vec<String> = store
        .list_secondary_indexes()
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.name)
        .collect();
    assert!(names.contains(&before[0].name));
    assert_eq!(names.len(), before.len());
}

// =============================================================================
// Staging
// =============================================================================

pub async fn test_staging_load_and_page<S: UsageStore>(store: &S) {
    let table = StagingTable::for_run("contract_page").unwrap();
    store.create_staging(&table).await.unwrap();

    let mut nulls = UsageRecord::default();
    nulls.event_type = Some("tab\there".to_string());
    let rows = staged(vec![
        make_record(20_001, at(2024, 4, 1)),
        make_record(20_002, at(2024, 4, 2)),
        nulls.clone(),
    ]);

    let mut writer = store.open_staging_writer(&table).await.unwrap();
    writer.write(&rows[..2]).await.unwrap();
    writer.write(&rows[2..]).await.unwrap();
    assert_eq!(writer.finish().await.unwrap(), 3);

    let mut tx = store.begin_merge().await.unwrap();
    let first = tx.fetch_staged(&table, 0, 2).await.unwrap();
    let second = tx.fetch_staged(&table, 2, 2).await.unwrap();
    let third = tx.fetch_staged(&table, 3, 2).await.unwrap();
    tx.rollback().await.unwrap();

    assert_eq!(first, rows[..2].to_vec());
    assert_eq!(second, rows[2..].to_vec(), "nulls and escapes should survive staging");
    assert!(third.is_empty());

    store.drop_staging(&table).await.unwrap();
}

pub async fn test_staging_abort_discards_rows<S: UsageStore>(store: &S) {
    let table = StagingTable::for_run("contract_abort").unwrap();
    store.create_staging(&table).await.unwrap();

    let mut writer = store.open_staging_writer(&table).await.unwrap();
    writer
        .write(&staged(vec![make_record(30_001, at(2024, 5, 1))]))
        .await
        .unwrap();
    writer.abort("contract test").await.unwrap();

    let mut tx = store.begin_merge().await.unwrap();
    let rows = tx.fetch_staged(&table, 0, 10).await.unwrap();
    tx.rollback().await.unwrap();
    assert!(rows.is_empty(), "aborted rows should not be visible");

    store.drop_staging(&table).await.unwrap();
}

pub async fn test_create_staging_recreates_empty<S: UsageStore>(store: &S) {
    let table = StagingTable::for_run("contract_recreate").unwrap();
    store.create_staging(&table).await.unwrap();
    let mut writer = store.open_staging_writer(&table).await.unwrap();
    writer
        .write(&staged(vec![make_record(40_001, at(2024, 5, 1))]))
        .await
        .unwrap();
    writer.finish().await.unwrap();

    store.create_staging(&table).await.unwrap();

    let mut tx = store.begin_merge().await.unwrap();
    let rows = tx.fetch_staged(&table, 0, 10).await.unwrap();
    tx.rollback().await.unwrap();
    assert!(rows.is_empty());

    store.drop_staging(&table).await.unwrap();
    store
        .drop_staging(&table)
        .await
        .expect("dropping a missing staging table should succeed");
}

// =============================================================================
// Merge
// =============================================================================

pub async fn test_insert_or_ignore_is_idempotent<S: UsageStore>(store: &S) {
    let before = store.fact_count().await.unwrap();
    let loaded = at(2024, 6, 2);
    let a = FactRow::from_record(make_record(50_001, at(2024, 6, 1)), loaded);
    let b = FactRow::from_record(make_record(50_002, at(2024, 6, 1)), loaded);
    let c = FactRow::from_record(make_record(50_003, at(2024, 6, 1)), loaded);

    assert_eq!(insert(store, &[a.clone(), a.clone(), b.clone()]).await, 2);
    assert_eq!(insert(store, &[a.clone(), b.clone(), c.clone()]).await, 1);
    assert_eq!(insert(store, &[a, b, c]).await, 0);

    assert_eq!(store.fact_count().await.unwrap(), before + 3);
}

pub async fn test_insert_chunks_large_batches<S: UsageStore>(store: &S) {
    let before = store.fact_count().await.unwrap();
    let loaded = at(2024, 6, 3);
    let rows: Vec<FactRow> = (0..2_500)
        .map(|i| FactRow::from_record(make_record(100_000 + i, at(2024, 6, 1)), loaded))
        .collect();

    assert_eq!(insert(store, &rows).await, 2_500);
    assert_eq!(store.fact_count().await.unwrap(), before + 2_500);
}

// =============================================================================
// Quality queries
// =============================================================================

pub async fn test_quality_counts<S: UsageStore>(store: &S) {
    // Loaded far in the future so no other test's rows fall in the window
    let loaded = at(2099, 1, 1);
    let mut missing_customer = make_record(60_001, at(2024, 6, 1));
    missing_customer.customer_id = None;
    let mut missing_type_and_time = make_record(60_002, at(2024, 6, 1));
    missing_type_and_time.event_type = None;
    missing_type_and_time.event_start_time = None;
    let future = make_record(60_003, at(2099, 6, 1));

    insert(
        store,
        &[
            FactRow::from_record(missing_customer, loaded),
            FactRow::from_record(missing_type_and_time, loaded),
            FactRow::from_record(future, loaded),
        ],
    )
    .await;

    let counts = store.critical_null_counts(loaded).await.unwrap();
    assert_eq!(counts.rows_checked, 3);
    assert_eq!(counts.missing_customer_id, 1);
    assert_eq!(counts.missing_event_start_time, 1);
    assert_eq!(counts.missing_event_type, 1);
    assert_eq!(counts.rows_with_any, 2);

    assert_eq!(store.future_dated_count(at(2099, 1, 1)).await.unwrap(), 1);
    assert_eq!(store.future_dated_count(at(2100, 1, 1)).await.unwrap(), 0);
}

// =============================================================================
// Retention and views
// =============================================================================

pub async fn test_delete_older_than_is_strict<S: UsageStore>(store: &S) {
    let cutoff = at(1990, 6, 1);
    insert(
        store,
        &[
            FactRow::from_record(make_record(70_001, at(1990, 1, 1)), cutoff),
            FactRow::from_record(make_record(70_002, cutoff), cutoff),
            FactRow::from_record(make_record(70_003, at(1990, 7, 1)), cutoff),
        ],
    )
    .await;

    let before = store.fact_count().await.unwrap();
    assert_eq!(store.delete_older_than(cutoff).await.unwrap(), 1);
    assert_eq!(store.delete_older_than(cutoff).await.unwrap(), 0);
    assert_eq!(store.fact_count().await.unwrap(), before - 1);
}

pub async fn test_refresh_views_is_repeatable<S: UsageStore>(store: &S) {
    store.refresh_views().await.expect("first refresh should succeed");
    store.refresh_views().await.expect("second refresh should succeed");
}

/// Run every UsageStore contract test against `$store`.
#[macro_export]
macro_rules! run_usage_store_tests {
    ($store:expr) => {
        use $crate::storage::usage_store_tests::*;

        test_schema_is_idempotent($store).await;
        println!("  test_schema_is_idempotent: PASSED");

        test_index_drop_and_recreate($store).await;
        println!("  test_index_drop_and_recreate: PASSED");

        test_rollback_restores_indexes_and_discards_rows($store).await;
        println!("  test_rollback_restores_indexes_and_discards_rows: PASSED");

        test_ensure_secondary_indexes_recreates_missing($store).await;
        println!("  test_ensure_secondary_indexes_recreates_missing: PASSED");

        test_staging_load_and_page($store).await;
        println!("  test_staging_load_and_page: PASSED");

        test_staging_abort_discards_rows($store).await;
        println!("  test_staging_abort_discards_rows: PASSED");

        test_create_staging_recreates_empty($store).await;
        println!("  test_create_staging_recreates_empty: PASSED");

        test_insert_or_ignore_is_idempotent($store).await;
        println!("  test_insert_or_ignore_is_idempotent: PASSED");

        test_insert_chunks_large_batches($store).await;
        println!("  test_insert_chunks_large_batches: PASSED");

        test_quality_counts($store).await;
        println!("  test_quality_counts: PASSED");

        test_delete_older_than_is_strict($store).await;
        println!("  test_delete_older_than_is_strict: PASSED");

        test_refresh_views_is_repeatable($store).await;
        println!("  test_refresh_views_is_repeatable: PASSED");
    };
}
