//! Usage record types.
//!
//! A [`UsageRecord`] is what the parser produces for one input line. It becomes
//! a [`StagingRow`] once it has an ordinal inside a run's staging table, and a
//! [`FactRow`] once the merge engine has assigned its identity.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Number of columns in an input line.
pub const USAGE_COLUMNS: usize = 9;

/// Upper bound on `event_type` length (VARCHAR(50)).
pub const MAX_EVENT_TYPE_LEN: usize = 50;

/// Fractional digits kept for `charge` (NUMERIC(18,8)).
pub const CHARGE_SCALE: u32 = 8;

/// Integer digits allowed for `charge` (NUMERIC(18,8)).
pub const CHARGE_INTEGER_DIGITS: u32 = 10;

/// One parsed usage event. Every field is nullable, as in the export.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UsageRecord {
    pub customer_id: Option<i32>,
    pub event_start_time: Option<DateTime<Utc>>,
    pub event_type: Option<String>,
    pub rate_plan_id: Option<i32>,
    /// Opaque upstream flag, passed through untouched.
    pub billing_flag_one: Option<i32>,
    /// Opaque upstream flag, passed through untouched.
    pub billing_flag_two: Option<i32>,
    /// Seconds.
    pub duration: Option<f64>,
    pub charge: Option<Decimal>,
    /// Billing month as `YYYY-MM`.
    pub month: Option<String>,
}

/// A record held in a run's staging table.
///
/// `seq` is the record's ordinal within the run and is only used to page
/// through staging. Staging rows carry no identity.
#[derive(Debug, Clone, PartialEq)]
pub struct StagingRow {
    pub seq: i64,
    pub record: UsageRecord,
}

/// A row of the durable fact table.
#[derive(Debug, Clone, PartialEq)]
pub struct FactRow {
    pub event_uuid: String,
    pub record: UsageRecord,
    /// Start time of the run that inserted the row.
    pub loaded_at: DateTime<Utc>,
}

impl FactRow {
    /// Build a fact row, deriving `event_uuid` from the record.
    pub fn from_record(record: UsageRecord, loaded_at: DateTime<Utc>) -> Self {
        let event_uuid = crate::identity::event_uuid(&record);
        Self {
            event_uuid,
            record,
            loaded_at,
        }
    }

    /// True if any field the quality gate treats as critical is null.
    pub fn has_critical_null(&self) -> bool {
        self.record.customer_id.is_none()
            || self.record.event_start_time.is_none()
            || self.record.event_type.is_none()
    }
}
