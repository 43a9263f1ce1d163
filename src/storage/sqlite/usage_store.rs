//! SQLite UsageStore implementation.
//!
//! SQLite has no timestamp or decimal types, so timestamps are stored as
//! fixed-width UTC text (lexical order is chronological order) and `charge`
//! as decimal text.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_query::{Expr, OnConflict, Order, Query, SimpleExpr, SqliteQueryBuilder};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, warn};

use crate::interfaces::{
    CriticalNullCounts, MergeTransaction, Result, SecondaryIndex, StagingTable, StagingWriter,
    StorageError, UsageStore,
};
use crate::record::{FactRow, StagingRow, UsageRecord};
use crate::storage::schema::{self, Staging, UsageFacts, RECORD_COLUMNS};

/// Rows per multi-row INSERT. SQLite caps a VALUES list at 500 rows.
const INSERT_CHUNK_ROWS: usize = 400;

/// Fixed-width UTC timestamp text.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub(crate) fn encode_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn decode_timestamp(column: &'static str, raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StorageError::Decode {
                column,
                reason: e.to_string(),
            })
    })
    .transpose()
}

fn decode_charge(raw: Option<String>) -> Result<Option<Decimal>> {
    raw.map(|s| {
        Decimal::from_str(&s).map_err(|e| StorageError::Decode {
            column: "charge",
            reason: e.to_string(),
        })
    })
    .transpose()
}

fn decode_record(row: &SqliteRow) -> Result<UsageRecord> {
    Ok(UsageRecord {
        customer_id: row.try_get("customer_id")?,
        event_start_time: decode_timestamp("event_start_time", row.try_get("event_start_time")?)?,
        event_type: row.try_get("event_type")?,
        rate_plan_id: row.try_get("rate_plan_id")?,
        billing_flag_one: row.try_get("billing_flag_one")?,
        billing_flag_two: row.try_get("billing_flag_two")?,
        duration: row.try_get("duration")?,
        charge: decode_charge(row.try_get("charge")?)?,
        month: row.try_get("month")?,
    })
}

fn decode_staged(row: &SqliteRow) -> Result<StagingRow> {
    Ok(StagingRow {
        seq: row.try_get("stage_seq")?,
        record: decode_record(row)?,
    })
}

fn decode_fact(row: &SqliteRow) -> Result<FactRow> {
    let loaded_at = decode_timestamp("loaded_at", row.try_get("loaded_at")?)?.ok_or_else(|| {
        StorageError::Decode {
            column: "loaded_at",
            reason: "unexpected NULL".to_string(),
        }
    })?;
    Ok(FactRow {
        event_uuid: row.try_get("event_uuid")?,
        record: decode_record(row)?,
        loaded_at,
    })
}

/// Record values in [`RECORD_COLUMNS`] order.
fn record_values(r: &UsageRecord) -> Vec<SimpleExpr> {
    vec![
        r.customer_id.into(),
        r.event_start_time.as_ref().map(encode_timestamp).into(),
        r.event_type.clone().into(),
        r.rate_plan_id.into(),
        r.billing_flag_one.into(),
        r.billing_flag_two.into(),
        r.duration.into(),
        r.charge.map(|c| c.to_string()).into(),
        r.month.clone().into(),
    ]
}

async fn execute_all(conn: &mut SqliteConnection, statements: &[String]) -> Result<()> {
    for sql in statements {
        sqlx::query(sql).execute(&mut *conn).await?;
    }
    Ok(())
}

/// Run `statements` inside `BEGIN IMMEDIATE ... COMMIT` on one connection.
async fn execute_in_transaction(pool: &SqlitePool, statements: &[String]) -> Result<u64> {
    let mut conn = pool.acquire().await?;
    // BEGIN IMMEDIATE takes the write lock upfront so a later upgrade cannot deadlock.
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

    let mut affected = 0;
    let mut result = Ok(());
    for sql in statements {
        match sqlx::query(sql).execute(&mut *conn).await {
            Ok(done) => affected += done.rows_affected(),
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }

    match result {
        Ok(()) => {
            commit_or_rollback(&mut conn).await?;
            Ok(affected)
        }
        Err(e) => {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            Err(e.into())
        }
    }
}

/// `COMMIT` a manual transaction. A failed `COMMIT` (a deferred constraint,
/// `SQLITE_BUSY`) leaves the transaction open, so it is rolled back before
/// the connection returns to the pool; if even that fails the connection is
/// closed instead of being reused.
async fn commit_or_rollback(conn: &mut PoolConnection<Sqlite>) -> Result<()> {
    let Err(e) = sqlx::query("COMMIT").execute(&mut **conn).await else {
        return Ok(());
    };
    if let Err(rollback) = sqlx::query("ROLLBACK").execute(&mut **conn).await {
        warn!(error = %rollback, "ROLLBACK after failed COMMIT failed, closing connection");
        conn.close_on_drop();
    }
    Err(e.into())
}

fn staging_insert_sql(table: &StagingTable, rows: &[StagingRow]) -> String {
    let mut insert = Query::insert();
    insert
        .into_table(schema::staging_table(table))
        .columns(schema::staging_insert_columns());
    for row in rows {
        let mut values: Vec<SimpleExpr> = vec![row.seq.into()];
        values.extend(record_values(&row.record));
        insert.values_panic(values);
    }
    insert.to_string(SqliteQueryBuilder)
}

fn fact_insert_sql(rows: &[FactRow]) -> String {
    let mut insert = Query::insert();
    insert
        .into_table(UsageFacts::Table)
        .columns(schema::fact_insert_columns())
        .on_conflict(OnConflict::column(UsageFacts::EventUuid).do_nothing().to_owned());
    for row in rows {
        let mut values = record_values(&row.record);
        values.push(row.event_uuid.clone().into());
        values.push(encode_timestamp(&row.loaded_at).into());
        insert.values_panic(values);
    }
    insert.to_string(SqliteQueryBuilder)
}

async fn query_indexes(conn: &mut SqliteConnection) -> Result<Vec<SecondaryIndex>> {
    let rows = sqlx::query(schema::SQLITE_LIST_SECONDARY_INDEXES)
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| SecondaryIndex {
            name: row.get("name"),
            definition: row.get("definition"),
        })
        .collect())
}

/// SQLite implementation of UsageStore.
pub struct SqliteUsageStore {
    pool: SqlitePool,
}

impl SqliteUsageStore {
    /// Create a new SQLite usage store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn index_statements() -> Vec<String> {
        schema::secondary_index_statements()
            .iter()
            .map(|s| s.to_string(SqliteQueryBuilder))
            .collect()
    }
}

#[async_trait]
impl UsageStore for SqliteUsageStore {
    async fn ensure_schema(&self) -> Result<()> {
        let mut statements = vec![schema::SQLITE_CREATE_FACT_TABLE.to_string()];
        statements.extend(Self::index_statements());
        execute_in_transaction(&self.pool, &statements).await?;
        debug!("Fact table schema ensured (SQLite)");
        Ok(())
    }

    async fn ensure_secondary_indexes(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        execute_all(&mut conn, &Self::index_statements()).await
    }

    async fn list_secondary_indexes(&self) -> Result<Vec<SecondaryIndex>> {
        let mut conn = self.pool.acquire().await?;
        query_indexes(&mut conn).await
    }

    async fn create_staging(&self, table: &StagingTable) -> Result<()> {
        let statements = [
            format!("DROP TABLE IF EXISTS {}", table.name()),
            schema::sqlite_create_staging_table(table),
        ];
        execute_in_transaction(&self.pool, &statements).await?;
        Ok(())
    }

    async fn open_staging_writer(&self, table: &StagingTable) -> Result<Box<dyn StagingWriter>> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(Box::new(SqliteStagingWriter {
            conn,
            table: table.clone(),
            written: 0,
        }))
    }

    async fn drop_staging(&self, table: &StagingTable) -> Result<()> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", table.name()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn begin_merge(&self) -> Result<Box<dyn MergeTransaction>> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(Box::new(SqliteMergeTransaction { conn }))
    }

    async fn critical_null_counts(&self, loaded_since: DateTime<Utc>) -> Result<CriticalNullCounts> {
        let row = sqlx::query(schema::SQLITE_CRITICAL_NULL_COUNTS)
            .bind(encode_timestamp(&loaded_since))
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
            .and_where(Expr::col(UsageFacts::EventStartTime).gt(encode_timestamp(&now)))
            .to_string(SqliteQueryBuilder);
        let count: i64 = sqlx::query_scalar(&query).fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let query = Query::delete()
            .from_table(UsageFacts::Table)
            .and_where(Expr::col(UsageFacts::EventStartTime).lt(encode_timestamp(&cutoff)))
            .to_string(SqliteQueryBuilder);
        execute_in_transaction(&self.pool, &[query]).await
    }

    async fn refresh_views(&self) -> Result<()> {
        // SQLite has no CREATE OR REPLACE VIEW
        let mut statements: Vec<String> = schema::VIEW_NAMES
            .iter()
            .map(|name| format!("DROP VIEW IF EXISTS {}", name))
            .collect();
        statements.push(schema::SQLITE_CREATE_USAGE_DISTRIBUTION_VIEW.to_string());
        statements.push(schema::SQLITE_CREATE_MONTHLY_TRENDS_VIEW.to_string());
        execute_in_transaction(&self.pool, &statements).await?;
        Ok(())
    }

    async fn fact_count(&self) -> Result<u64> {
        let query = Query::select()
            .expr(Expr::col(UsageFacts::EventUuid).count())
            .from(UsageFacts::Table)
            .to_string(SqliteQueryBuilder);
        let count: i64 = sqlx::query_scalar(&query).fetch_one(&self.pool).await?;
        Ok(count as u64)
    }
}

/// Staging load inside one write transaction; nothing is visible until
/// `finish` commits.
struct SqliteStagingWriter {
    conn: PoolConnection<Sqlite>,
    table: StagingTable,
    written: u64,
}

#[async_trait]
impl StagingWriter for SqliteStagingWriter {
    async fn write(&mut self, rows: &[StagingRow]) -> Result<()> {
        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            let sql = staging_insert_sql(&self.table, chunk);
            self.written += sqlx::query(&sql)
                .execute(&mut *self.conn)
                .await?
                .rows_affected();
        }
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<u64> {
        commit_or_rollback(&mut self.conn).await?;
        Ok(self.written)
    }

    async fn abort(mut self: Box<Self>, reason: &str) -> Result<()> {
        debug!(table = %self.table, reason, "Aborting staging load");
        sqlx::query("ROLLBACK").execute(&mut *self.conn).await?;
        Ok(())
    }
}

/// The merge transaction, held open on one pooled connection.
struct SqliteMergeTransaction {
    conn: PoolConnection<Sqlite>,
}

#[async_trait]
impl MergeTransaction for SqliteMergeTransaction {
    async fn secondary_indexes(&mut self) -> Result<Vec<SecondaryIndex>> {
        query_indexes(&mut self.conn).await
    }

    async fn drop_index(&mut self, name: &str) -> Result<()> {
        let sql = format!("DROP INDEX IF EXISTS {}", schema::quote_ident(name));
        sqlx::query(&sql).execute(&mut *self.conn).await?;
        Ok(())
    }

    async fn create_index(&mut self, index: &SecondaryIndex) -> Result<()> {
        sqlx::query(&index.definition)
            .execute(&mut *self.conn)
            .await?;
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
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&mut *self.conn).await?;
        rows.iter().map(decode_staged).collect()
    }

    async fn insert_or_ignore(&mut self, rows: &[FactRow]) -> Result<u64> {
        let mut inserted = 0;
        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            let sql = fact_insert_sql(chunk);
            inserted += sqlx::query(&sql)
                .execute(&mut *self.conn)
                .await?
                .rows_affected();
        }
        Ok(inserted)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        commit_or_rollback(&mut self.conn).await
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        sqlx::query("ROLLBACK").execute(&mut *self.conn).await?;
        Ok(())
    }
}

/// Read back every fact row, ordered by identity. Used by tests.
pub async fn fetch_facts(pool: &SqlitePool) -> Result<Vec<FactRow>> {
    let query = Query::select()
        .columns(schema::fact_insert_columns())
        .from(UsageFacts::Table)
        .order_by(UsageFacts::EventUuid, Order::Asc)
        .to_string(SqliteQueryBuilder);
    let rows = sqlx::query(&query).fetch_all(pool).await?;
    rows.iter().map(decode_fact).collect()
}
