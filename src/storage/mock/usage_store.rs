//! Mock UsageStore implementation for testing.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::PostgresQueryBuilder;
use tokio::sync::RwLock;

use crate::interfaces::{
    CriticalNullCounts, MergeTransaction, Result, SecondaryIndex, StagingTable, StagingWriter,
    StorageError, UsageStore,
};
use crate::record::{FactRow, StagingRow, UsageRecord};
use crate::storage::schema;

/// Everything a merge transaction can change, cloned on `begin_merge`.
#[derive(Clone, Default)]
struct Committed {
    facts: BTreeMap<String, FactRow>,
    indexes: BTreeMap<String, SecondaryIndex>,
}

#[derive(Default)]
struct Shared {
    committed: RwLock<Committed>,
    staging: RwLock<HashMap<StagingTable, BTreeMap<i64, UsageRecord>>>,
    views_refreshed: RwLock<u32>,
    fail_on_staging_write: RwLock<bool>,
    fail_on_insert: RwLock<bool>,
    fail_on_create_index: RwLock<bool>,
    fail_on_commit: RwLock<bool>,
    fail_on_quality: RwLock<bool>,
    fail_on_delete: RwLock<bool>,
    fail_on_views: RwLock<bool>,
}

fn injected(operation: &str) -> StorageError {
    StorageError::Backend(format!("injected failure: {}", operation))
}

fn catalogued_indexes() -> impl Iterator<Item = SecondaryIndex> {
    schema::secondary_index_statements()
        .into_iter()
        .zip(schema::SECONDARY_INDEXES.iter())
        .map(|(statement, (name, _))| SecondaryIndex {
            name: name.to_string(),
            definition: statement.to_string(PostgresQueryBuilder),
        })
}

/// Mock usage store that keeps everything in memory.
///
/// A merge transaction works on a private copy of the fact table and index
/// catalog; `commit` publishes it and `rollback` discards it.
#[derive(Default, Clone)]
pub struct MockUsageStore {
    shared: Arc<Shared>,
}

impl MockUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_staging_write(&self, fail: bool) {
        *self.shared.fail_on_staging_write.write().await = fail;
    }

    pub async fn set_fail_on_insert(&self, fail: bool) {
        *self.shared.fail_on_insert.write().await = fail;
    }

    pub async fn set_fail_on_create_index(&self, fail: bool) {
        *self.shared.fail_on_create_index.write().await = fail;
    }

    /// A failed commit discards the transaction's changes.
    pub async fn set_fail_on_commit(&self, fail: bool) {
        *self.shared.fail_on_commit.write().await = fail;
    }

    pub async fn set_fail_on_quality(&self, fail: bool) {
        *self.shared.fail_on_quality.write().await = fail;
    }

    pub async fn set_fail_on_delete(&self, fail: bool) {
        *self.shared.fail_on_delete.write().await = fail;
    }

    pub async fn set_fail_on_views(&self, fail: bool) {
        *self.shared.fail_on_views.write().await = fail;
    }

    /// Committed fact rows, ordered by `event_uuid`.
    pub async fn facts(&self) -> Vec<FactRow> {
        self.shared.committed.read().await.facts.values().cloned().collect()
    }

    /// Seed committed fact rows directly.
    pub async fn insert_facts(&self, rows: Vec<FactRow>) {
        let mut committed = self.shared.committed.write().await;
        for row in rows {
            committed.facts.entry(row.event_uuid.clone()).or_insert(row);
        }
    }

    /// Committed index catalog, ordered by name.
    pub async fn indexes(&self) -> Vec<SecondaryIndex> {
        self.shared.committed.read().await.indexes.values().cloned().collect()
    }

    /// Staging tables that currently exist.
    pub async fn staging_tables(&self) -> Vec<StagingTable> {
        self.shared.staging.read().await.keys().cloned().collect()
    }

    /// Rows held in a staging table, ordered by `seq`.
    pub async fn staged_rows(&self, table: &StagingTable) -> Vec<StagingRow> {
        self.shared
            .staging
            .read()
            .await
            .get(table)
            .map(|rows| {
                rows.iter()
                    .map(|(seq, record)| StagingRow {
                        seq: *seq,
                        record: record.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn views_refreshed(&self) -> u32 {
        *self.shared.views_refreshed.read().await
    }
}

#[async_trait]
impl UsageStore for MockUsageStore {
    async fn ensure_schema(&self) -> Result<()> {
        self.ensure_secondary_indexes().await
    }

    async fn ensure_secondary_indexes(&self) -> Result<()> {
        let mut committed = self.shared.committed.write().await;
        for index in catalogued_indexes() {
            committed.indexes.entry(index.name.clone()).or_insert(index);
        }
        Ok(())
    }

    async fn list_secondary_indexes(&self) -> Result<Vec<SecondaryIndex>> {
        Ok(self.indexes().await)
    }

    async fn create_staging(&self, table: &StagingTable) -> Result<()> {
        self.shared
            .staging
            .write()
            .await
            .insert(table.clone(), BTreeMap::new());
        Ok(())
    }

    async fn open_staging_writer(&self, table: &StagingTable) -> Result<Box<dyn StagingWriter>> {
        if !self.shared.staging.read().await.contains_key(table) {
            return Err(StorageError::StagingNotFound(table.to_string()));
        }
        Ok(Box::new(MockStagingWriter {
            shared: self.shared.clone(),
            table: table.clone(),
            pending: Vec::new(),
        }))
    }

    async fn drop_staging(&self, table: &StagingTable) -> Result<()> {
        self.shared.staging.write().await.remove(table);
        Ok(())
    }

    async fn begin_merge(&self) -> Result<Box<dyn MergeTransaction>> {
        let working = self.shared.committed.read().await.clone();
        Ok(Box::new(MockMergeTransaction {
            shared: self.shared.clone(),
            working,
        }))
    }

    async fn critical_null_counts(&self, loaded_since: DateTime<Utc>) -> Result<CriticalNullCounts> {
        if *self.shared.fail_on_quality.read().await {
            return Err(injected("critical_null_counts"));
        }
        let committed = self.shared.committed.read().await;
        let mut counts = CriticalNullCounts::default();
        for row in committed.facts.values().filter(|r| r.loaded_at >= loaded_since) {
            counts.rows_checked += 1;
            counts.missing_customer_id += row.record.customer_id.is_none() as u64;
            counts.missing_event_start_time += row.record.event_start_time.is_none() as u64;
            counts.missing_event_type += row.record.event_type.is_none() as u64;
            counts.rows_with_any += row.has_critical_null() as u64;
        }
        Ok(counts)
    }

    async fn future_dated_count(&self, now: DateTime<Utc>) -> Result<u64> {
        if *self.shared.fail_on_quality.read().await {
            return Err(injected("future_dated_count"));
        }
        let committed = self.shared.committed.read().await;
        Ok(committed
            .facts
            .values()
            .filter(|r| r.record.event_start_time.is_some_and(|t| t > now))
            .count() as u64)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        if *self.shared.fail_on_delete.read().await {
            return Err(injected("delete_older_than"));
        }
        let mut committed = self.shared.committed.write().await;
        let before = committed.facts.len();
        committed
            .facts
            .retain(|_, r| !r.record.event_start_time.is_some_and(|t| t < cutoff));
        Ok((before - committed.facts.len()) as u64)
    }

    async fn refresh_views(&self) -> Result<()> {
        if *self.shared.fail_on_views.read().await {
            return Err(injected("refresh_views"));
        }
        *self.shared.views_refreshed.write().await += 1;
        Ok(())
    }

    async fn fact_count(&self) -> Result<u64> {
        Ok(self.shared.committed.read().await.facts.len() as u64)
    }
}

struct MockStagingWriter {
    shared: Arc<Shared>,
    table: StagingTable,
    pending: Vec<StagingRow>,
}

#[async_trait]
impl StagingWriter for MockStagingWriter {
    async fn write(&mut self, rows: &[StagingRow]) -> Result<()> {
        if *self.shared.fail_on_staging_write.read().await {
            return Err(injected("staging write"));
        }
        self.pending.extend_from_slice(rows);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<u64> {
        let Self {
            shared,
            table,
            pending,
        } = *self;
        let mut staging = shared.staging.write().await;
        let rows = staging
            .get_mut(&table)
            .ok_or_else(|| StorageError::StagingNotFound(table.to_string()))?;
        let accepted = pending.len() as u64;
        for row in pending {
            rows.insert(row.seq, row.record);
        }
        Ok(accepted)
    }

    async fn abort(self: Box<Self>, _reason: &str) -> Result<()> {
        Ok(())
    }
}

struct MockMergeTransaction {
    shared: Arc<Shared>,
    working: Committed,
}

#[async_trait]
impl MergeTransaction for MockMergeTransaction {
    async fn secondary_indexes(&mut self) -> Result<Vec<SecondaryIndex>> {
        Ok(self.working.indexes.values().cloned().collect())
    }

    async fn drop_index(&mut self, name: &str) -> Result<()> {
        self.working.indexes.remove(name);
        Ok(())
    }

    async fn create_index(&mut self, index: &SecondaryIndex) -> Result<()> {
        if *self.shared.fail_on_create_index.read().await {
            return Err(injected("create_index"));
        }
        self.working
            .indexes
            .insert(index.name.clone(), index.clone());
        Ok(())
    }

    async fn fetch_staged(
        &mut self,
        table: &StagingTable,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<StagingRow>> {
        let staging = self.shared.staging.read().await;
        let rows = staging
            .get(table)
            .ok_or_else(|| StorageError::StagingNotFound(table.to_string()))?;
        Ok(rows
            .range(after_seq.saturating_add(1)..)
            .take(limit)
            .map(|(seq, record)| StagingRow {
                seq: *seq,
                record: record.clone(),
            })
            .collect())
    }

    async fn insert_or_ignore(&mut self, rows: &[FactRow]) -> Result<u64> {
        if *self.shared.fail_on_insert.read().await {
            return Err(injected("insert_or_ignore"));
        }
        let mut inserted = 0;
        for row in rows {
            if !self.working.facts.contains_key(&row.event_uuid) {
                self.working
                    .facts
                    .insert(row.event_uuid.clone(), row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let Self { shared, working } = *self;
        if *shared.fail_on_commit.read().await {
            return Err(injected("commit"));
        }
        *shared.committed.write().await = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
