//! Encoding for `COPY ... FROM STDIN` in PostgreSQL text format.
//!
//! One line per row, tab-separated, `\N` for NULL. Backslash, tab, newline and
//! carriage return inside values are backslash-escaped.

use chrono::{DateTime, Utc};

use crate::record::StagingRow;

/// `COPY` statement loading a staging table in text format.
pub fn copy_statement(table: &str) -> String {
    format!(
        "COPY {} (stage_seq, {}) FROM STDIN WITH (FORMAT text)",
        table,
        crate::storage::schema::RECORD_COLUMN_LIST
    )
}

/// Append one row to a COPY buffer.
pub fn encode_row(buf: &mut Vec<u8>, row: &StagingRow) {
    let r = &row.record;
    push_field(buf, Some(row.seq.to_string()), true);
    push_field(buf, r.customer_id.map(|v| v.to_string()), false);
    push_field(buf, r.event_start_time.as_ref().map(encode_timestamp), false);
    push_field(buf, r.event_type.as_deref().map(escape), false);
    push_field(buf, r.rate_plan_id.map(|v| v.to_string()), false);
    push_field(buf, r.billing_flag_one.map(|v| v.to_string()), false);
    push_field(buf, r.billing_flag_two.map(|v| v.to_string()), false);
    push_field(buf, r.duration.map(|v| v.to_string()), false);
    push_field(buf, r.charge.map(|v| v.to_string()), false);
    push_field(buf, r.month.as_deref().map(escape), false);
    buf.push(b'\n');
}

fn push_field(buf: &mut Vec<u8>, value: Option<String>, first: bool) {
    if !first {
        buf.push(b'\t');
    }
    match value {
        Some(v) => buf.extend_from_slice(v.as_bytes()),
        None => buf.extend_from_slice(b"\\N"),
    }
}

fn encode_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.6f+00").to_string()
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}
