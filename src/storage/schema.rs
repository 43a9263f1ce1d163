//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building,
//! the DDL for each backend, and the catalogue of secondary indexes.

use sea_query::{Alias, Iden, Index, IndexCreateStatement};

use crate::interfaces::StagingTable;

/// Name of the durable fact table.
pub const FACT_TABLE: &str = "telco_billings_usage";

/// Usage fact table schema.
#[derive(Iden, Clone, Copy)]
pub enum UsageFacts {
    #[iden = "telco_billings_usage"]
    Table,
    #[iden = "customer_id"]
    CustomerId,
    #[iden = "event_start_time"]
    EventStartTime,
    #[iden = "event_type"]
    EventType,
    #[iden = "rate_plan_id"]
    RatePlanId,
    #[iden = "billing_flag_one"]
    BillingFlagOne,
    #[iden = "billing_flag_two"]
    BillingFlagTwo,
    #[iden = "duration"]
    Duration,
    #[iden = "charge"]
    Charge,
    #[iden = "month"]
    Month,
    #[iden = "event_uuid"]
    EventUuid,
    #[iden = "loaded_at"]
    LoadedAt,
}

/// Staging-only columns. The remaining staging columns reuse [`UsageFacts`].
#[derive(Iden, Clone, Copy)]
pub enum Staging {
    #[iden = "stage_seq"]
    StageSeq,
}

/// Record columns in input order, shared by staging and fact tables.
pub const RECORD_COLUMNS: [UsageFacts; 9] = [
    UsageFacts::CustomerId,
    UsageFacts::EventStartTime,
    UsageFacts::EventType,
    UsageFacts::RatePlanId,
    UsageFacts::BillingFlagOne,
    UsageFacts::BillingFlagTwo,
    UsageFacts::Duration,
    UsageFacts::Charge,
    UsageFacts::Month,
];

/// Record columns as a comma-separated list (for COPY column lists).
pub const RECORD_COLUMN_LIST: &str = "customer_id, event_start_time, event_type, rate_plan_id, \
     billing_flag_one, billing_flag_two, duration, charge, month";

/// Fact table insert columns: the record columns, then identity and load time.
pub fn fact_insert_columns() -> Vec<UsageFacts> {
    let mut columns = RECORD_COLUMNS.to_vec();
    columns.extend([UsageFacts::EventUuid, UsageFacts::LoadedAt]);
    columns
}

/// Staging table insert columns: the ordinal, then the record columns.
pub fn staging_insert_columns() -> Vec<Alias> {
    std::iter::once(Alias::new("stage_seq"))
        .chain(RECORD_COLUMN_LIST.split(", ").map(Alias::new))
        .collect()
}

/// sea-query table reference for a staging table.
pub fn staging_table(table: &StagingTable) -> Alias {
    Alias::new(table.name())
}

/// Secondary indexes created with the fact table: (name, column).
pub const SECONDARY_INDEXES: &[(&str, UsageFacts)] = &[
    ("idx_billing_customer_id", UsageFacts::CustomerId),
    ("idx_billing_event_time", UsageFacts::EventStartTime),
    ("idx_billing_event_type", UsageFacts::EventType),
    ("idx_billing_month", UsageFacts::Month),
    ("idx_billing_loaded_at", UsageFacts::LoadedAt),
];

/// `CREATE INDEX IF NOT EXISTS` statements for the catalogued indexes.
pub fn secondary_index_statements() -> Vec<IndexCreateStatement> {
    SECONDARY_INDEXES
        .iter()
        .map(|(name, column)| {
            Index::create()
                .if_not_exists()
                .name(*name)
                .table(UsageFacts::Table)
                .col(*column)
                .to_owned()
        })
        .collect()
}

/// Quote an identifier taken from the catalog.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// PostgreSQL fact table.
pub const PG_CREATE_FACT_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS telco_billings_usage (
    customer_id INTEGER,
    event_start_time TIMESTAMP WITH TIME ZONE,
    event_type VARCHAR(50),
    rate_plan_id INTEGER,
    billing_flag_one INTEGER,
    billing_flag_two INTEGER,
    duration FLOAT8,
    charge NUMERIC(18, 8),
    month VARCHAR(7),
    event_uuid VARCHAR(32) PRIMARY KEY,
    loaded_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT CURRENT_TIMESTAMP
)
"#;

/// PostgreSQL staging table body; the name is supplied per run.
pub fn pg_create_staging_table(table: &StagingTable) -> String {
    format!(
        r#"
CREATE UNLOGGED TABLE {} (
    stage_seq BIGINT PRIMARY KEY,
    customer_id INTEGER,
    event_start_time TIMESTAMP WITH TIME ZONE,
    event_type VARCHAR(50),
    rate_plan_id INTEGER,
    billing_flag_one INTEGER,
    billing_flag_two INTEGER,
    duration FLOAT8,
    charge NUMERIC(18, 8),
    month VARCHAR(7)
)
"#,
        table.name()
    )
}

/// Non-unique, non-primary indexes on the fact table with their definitions.
pub const PG_LIST_SECONDARY_INDEXES: &str = r#"
SELECT c.relname::text AS name, pg_get_indexdef(i.indexrelid) AS definition
FROM pg_index i
JOIN pg_class c ON c.oid = i.indexrelid
WHERE i.indrelid = to_regclass('telco_billings_usage')
  AND NOT i.indisprimary
  AND NOT i.indisunique
ORDER BY c.relname
"#;

/// Critical-null counts inside the recency window. `$1` is the window start.
pub const PG_CRITICAL_NULL_COUNTS: &str = r#"
SELECT
    COUNT(*) AS rows_checked,
    COALESCE(SUM(CASE WHEN customer_id IS NULL THEN 1 ELSE 0 END), 0) AS missing_customer_id,
    COALESCE(SUM(CASE WHEN event_start_time IS NULL THEN 1 ELSE 0 END), 0) AS missing_event_start_time,
    COALESCE(SUM(CASE WHEN event_type IS NULL THEN 1 ELSE 0 END), 0) AS missing_event_type,
    COALESCE(SUM(CASE WHEN customer_id IS NULL OR event_start_time IS NULL OR event_type IS NULL
                      THEN 1 ELSE 0 END), 0) AS rows_with_any
FROM telco_billings_usage
WHERE loaded_at >= $1
"#;

pub const PG_CREATE_USAGE_DISTRIBUTION_VIEW: &str = r#"
CREATE OR REPLACE VIEW analytics_usage_distribution AS
SELECT
    event_type AS service_type,
    rate_plan_id,
    COUNT(*) AS event_count,
    SUM(duration) AS total_duration,
    SUM(charge) AS total_charge,
    COUNT(DISTINCT customer_id) AS customer_count
FROM telco_billings_usage
GROUP BY event_type, rate_plan_id
ORDER BY event_type, rate_plan_id
"#;

pub const PG_CREATE_MONTHLY_TRENDS_VIEW: &str = r#"
CREATE OR REPLACE VIEW analytics_monthly_trends AS
SELECT
    month,
    event_type AS service_type,
    COUNT(*) AS event_count,
    COUNT(DISTINCT customer_id) AS customer_count,
    SUM(duration) AS total_duration,
    SUM(charge) AS total_charge
FROM telco_billings_usage
GROUP BY month, event_type
ORDER BY month, event_type
"#;

/// SQLite fact table. Timestamps are fixed-width UTC text and charge is
/// decimal text, so ordering and precision match PostgreSQL.
pub const SQLITE_CREATE_FACT_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS telco_billings_usage (
    customer_id INTEGER,
    event_start_time TEXT,
    event_type TEXT,
    rate_plan_id INTEGER,
    billing_flag_one INTEGER,
    billing_flag_two INTEGER,
    duration REAL,
    charge TEXT,
    month TEXT,
    event_uuid TEXT NOT NULL PRIMARY KEY,
    loaded_at TEXT NOT NULL
)
"#;

pub fn sqlite_create_staging_table(table: &StagingTable) -> String {
    format!(
        r#"
CREATE TABLE {} (
    stage_seq INTEGER PRIMARY KEY,
    customer_id INTEGER,
    event_start_time TEXT,
    event_type TEXT,
    rate_plan_id INTEGER,
    billing_flag_one INTEGER,
    billing_flag_two INTEGER,
    duration REAL,
    charge TEXT,
    month TEXT
)
"#,
        table.name()
    )
}

pub const SQLITE_LIST_SECONDARY_INDEXES: &str = r#"
SELECT name, sql AS definition
FROM sqlite_master
WHERE type = 'index'
  AND tbl_name = 'telco_billings_usage'
  AND sql IS NOT NULL
  AND sql NOT LIKE 'CREATE UNIQUE%'
ORDER BY name
"#;

/// Critical-null counts inside the recency window. `?` is the window start.
pub const SQLITE_CRITICAL_NULL_COUNTS: &str = r#"
SELECT
    COUNT(*) AS rows_checked,
    COALESCE(SUM(CASE WHEN customer_id IS NULL THEN 1 ELSE 0 END), 0) AS missing_customer_id,
    COALESCE(SUM(CASE WHEN event_start_time IS NULL THEN 1 ELSE 0 END), 0) AS missing_event_start_time,
    COALESCE(SUM(CASE WHEN event_type IS NULL THEN 1 ELSE 0 END), 0) AS missing_event_type,
    COALESCE(SUM(CASE WHEN customer_id IS NULL OR event_start_time IS NULL OR event_type IS NULL
                      THEN 1 ELSE 0 END), 0) AS rows_with_any
FROM telco_billings_usage
WHERE loaded_at >= ?
"#;

pub const SQLITE_CREATE_USAGE_DISTRIBUTION_VIEW: &str = r#"
CREATE VIEW analytics_usage_distribution AS
SELECT
    event_type AS service_type,
    rate_plan_id,
    COUNT(*) AS event_count,
    SUM(duration) AS total_duration,
    SUM(CAST(charge AS REAL)) AS total_charge,
    COUNT(DISTINCT customer_id) AS customer_count
FROM telco_billings_usage
GROUP BY event_type, rate_plan_id
ORDER BY event_type, rate_plan_id
"#;

pub const SQLITE_CREATE_MONTHLY_TRENDS_VIEW: &str = r#"
CREATE VIEW analytics_monthly_trends AS
SELECT
    month,
    event_type AS service_type,
    COUNT(*) AS event_count,
    COUNT(DISTINCT customer_id) AS customer_count,
    SUM(duration) AS total_duration,
    SUM(CAST(charge AS REAL)) AS total_charge
FROM telco_billings_usage
GROUP BY month, event_type
ORDER BY month, event_type
"#;

/// Analytics views, for backends that recreate them from scratch.
pub const VIEW_NAMES: &[&str] = &["analytics_usage_distribution", "analytics_monthly_trends"];
