//! PostgreSQL UsageStore implementation.
//!
//! Staging tables are UNLOGGED and loaded through `COPY ... FROM STDIN`, the
//! fastest bulk path PostgreSQL offers. The merge runs in one transaction;
//! DDL is transactional, so a rollback also restores dropped indexes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_query::{Expr, OnConflict, Order, PostgresQueryBuilder, Query, SimpleExpr};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgCopyIn, PgPoolCopyExt, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;

use super::copy;
use crate::interfaces::{
    CriticalNullCounts, MergeTransaction, Result, SecondaryIndex, StagingTable, StagingWriter,
    UsageStore,
};
use crate::record::{FactRow, StagingRow, UsageRecord};
use crate::storage::schema::{self, Staging, UsageFacts, RECORD_COLUMNS};

/// Rows per INSERT statement during the merge.
const INSERT_CHUNK_ROWS: usize = 1_000;

/// PostgreSQL implementation of UsageStore.
pub struct PostgresUsageStore {
    pool: PgPool,
}

impl PostgresUsageStore {
    /// Create a new PostgreSQL usage store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn index_statements() -> Vec<String> {
        schema::secondary_index_statements()
            .iter()
            .map(|s| s.to_string(PostgresQueryBuilder))
            .collect()
    }

    async fn query_indexes<'e, E>(executor: E) -> Result<Vec<SecondaryIndex>>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let rows = sqlx::query(schema::PG_LIST_SECONDARY_INDEXES)
            .fetch_all(executor)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| SecondaryIndex {
                name: row.get("name"),
                definition: row.get("definition"),
            })
            .collect())
    }
}

fn decode_staged(row: &PgRow) -> Result<StagingRow> {
    Ok(StagingRow {
        seq: row.try_get("stage_seq")?,
        record: UsageRecord {
            customer_id: row.try_get("customer_id")?,
            event_start_time: row.try_get::<Option<DateTime<Utc>>, _>("event_start_time")?,
            event_type: row.try_get("event_type")?,
            rate_plan_id: row.try_get("rate_plan_id")?,
            billing_flag_one: row.try_get("billing_flag_one")?,
            billing_flag_two: row.try_get("billing_flag_two")?,
            duration: row.try_get("duration")?,
            charge: row.try_get::<Option<Decimal>, _>("charge")?,
            month: row.try_get("month")?,
        },
    })
}

fn fact_insert_sql(rows: &[FactRow]) -> String {
    let mut insert = Query::insert();
    insert
        .into_table(UsageFacts::Table)
        .columns(schema::fact_insert_columns())
        .on_conflict(OnConflict::column(UsageFacts::EventUuid).do_nothing().to_owned());

    for row in rows {
        let r = &row.record;
        let values: [SimpleExpr; 11] = [
            r.customer_id.into(),
            r.event_start_time.into(),
            r.event_type.clone().into(),
            r.rate_plan_id.into(),
            r.billing_flag_one.into(),
            r.billing_flag_two.into(),
            r.duration.into(),
            r.charge.into(),
            r.month.clone().into(),
            row.event_uuid.clone().into(),
            row.loaded_at.into(),
        ];
        insert.values_panic(values);
    }
    insert.to_string(PostgresQueryBuilder)
}

#[async_trait]
impl UsageStore for PostgresUsageStore {
    async fn ensure_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(schema::PG_CREATE_FACT_TABLE)
            .execute(&mut *tx)
            .await?;
        for sql in Self::index_statements() {
            sqlx::query(&sql).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        debug!("Fact table schema ensured (PostgreSQL)");
        Ok(())
    }

    async fn ensure_secondary_indexes(&self) -> Result<()> {
        for sql in Self::index_statements() {
            sqlx::query(&sql).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn list_secondary_indexes(&self) -> Result<Vec<SecondaryIndex>> {
        Self::query_indexes(&self.pool).await
    }

    async fn create_staging(&self, table: &StagingTable) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", table.name()))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&schema::pg_create_staging_table(table))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn open_staging_writer(&self, table: &StagingTable) -> Result<Box<dyn StagingWriter>> {
        let copy_in = self
            .pool
            .copy_in_raw(&copy::copy_statement(table.name()))
            .await?;
        Ok(Box::new(PostgresStagingWriter {
            copy_in,
            buf: Vec::with_capacity(64 * 1024),
        }))
    }

    async fn drop_staging(&self, table: &StagingTable) -> Result<()> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", table.name()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn begin_merge(&self) -> Result<Box<dyn MergeTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresMergeTransaction { tx }))
    }

    async fn critical_null_counts(&self, loaded_since: DateTime<Utc>) -> Result<CriticalNullCounts> {
        let row = sqlx::query(schema::PG_CRITICAL_NULL_COUNTS)
            .bind(loaded_since)
            .fetch_one(&self.pool)
            .await?;
        Ok(CriticalNullCounts {
            rows_checked: row.get::<i64, _>("rows_checked") as u64,
            missing_customer_id: row.get::<i64, _>("missing_customer_id") as u64,
            missing_event_start_time: row.get::<i64, _>("missing_event_start_time") as u64,
            missing_event_type: row.get::<i64, _>("missing_event_type") as u64,
            rows_with_any: row.get::<i64, _>("rows_with_any") as u64,
        })
    }

    async fn future_dated_count(&self, now: DateTime<Utc>) -> Result<u64> {
        let query = Query::select()
            .expr(Expr::col(UsageFacts::EventUuid).count())
            .from(UsageFacts::Table)
            .and_where(Expr::col(UsageFacts::EventStartTime).gt(now))
            .to_string(PostgresQueryBuilder);
        let count: i64 = sqlx::query_scalar(&query).fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let query = Query::delete()
            .from_table(UsageFacts::Table)
            .and_where(Expr::col(UsageFacts::EventStartTime).lt(cutoff))
            .to_string(PostgresQueryBuilder);

        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query(&query).execute(&mut *tx).await?.rows_affected();
        tx.commit().await?;
        Ok(deleted)
    }

    async fn refresh_views(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(schema::PG_CREATE_USAGE_DISTRIBUTION_VIEW)
            .execute(&mut *tx)
            .await?;
        sqlx::query(schema::PG_CREATE_MONTHLY_TRENDS_VIEW)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn fact_count(&self) -> Result<u64> {
        let query = Query::select()
            .expr(Expr::col(UsageFacts::EventUuid).count())
            .from(UsageFacts::Table)
            .to_string(PostgresQueryBuilder);
        let count: i64 = sqlx::query_scalar(&query).fetch_one(&self.pool).await?;
        Ok(count as u64)
    }
}

/// COPY session into a staging table.
struct PostgresStagingWriter {
    copy_in: PgCopyIn<PoolConnection<Postgres>>,
    buf: Vec<u8>,
}

#[async_trait]
impl StagingWriter for PostgresStagingWriter {
    async fn write(&mut self, rows: &[StagingRow]) -> Result<()> {
        for row in rows {
            copy::encode_row(&mut self.buf, row);
        }
        let chunk = std::mem::take(&mut self.buf);
        self.copy_in.send(chunk).await?;
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<u64> {
        let rows = self.copy_in.finish().await?;
        Ok(rows)
    }

    async fn abort(self: Box<Self>, reason: &str) -> Result<()> {
        self.copy_in.abort(reason).await?;
        Ok(())
    }
}

/// The merge transaction.
struct PostgresMergeTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl MergeTransaction for PostgresMergeTransaction {
    async fn secondary_indexes(&mut self) -> Result<Vec<SecondaryIndex>> {
        PostgresUsageStore::query_indexes(&mut *self.tx).await
    }

    async fn drop_index(&mut self, name: &str) -> Result<()> {
        let sql = format!("DROP INDEX IF EXISTS {}", schema::quote_ident(name));
        sqlx::query(&sql).execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn create_index(&mut self, index: &SecondaryIndex) -> Result<()> {
        sqlx::query(&index.definition).execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn fetch_staged(
        &mut self,
        table: &StagingTable,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<StagingRow>> {
        let query = Query::select()
            .column(Staging::StageSeq)
            .columns(RECORD_COLUMNS)
            .from(schema::staging_table(table))
            .and_where(Expr::col(Staging::StageSeq).gt(after_seq))
            .order_by(Staging::StageSeq, Order::Asc)
            .limit(limit as u64)
            .to_string(PostgresQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&mut *self.tx).await?;
        rows.iter().map(decode_staged).collect()
    }

    async fn insert_or_ignore(&mut self, rows: &[FactRow]) -> Result<u64> {
        let mut inserted = 0;
        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            let sql = fact_insert_sql(chunk);
            inserted += sqlx::query(&sql).execute(&mut *self.tx).await?.rows_affected();
        }
        Ok(inserted)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
