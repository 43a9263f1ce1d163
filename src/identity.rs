//! Content-derived identity for usage events.
//!
//! `event_uuid` is the first 128 bits of a SHA-256 digest over a fixed field
//! tuple, rendered as 32 lowercase hex characters:
//!
//! ```text
//! customer_id ␟ event_start_time ␟ event_type ␟ rate_plan_id ␟ duration ␟ charge
//! ```
//!
//! - `event_start_time` is rendered in UTC with microsecond precision.
//! - `duration` uses Rust's shortest round-trip float formatting.
//! - `charge` is normalized, so `1.50000000` and `1.5` hash alike.
//! - A null field is encoded as NUL, distinct from an empty string.
//!
//! Billing flags, month and load time never take part. Changing this tuple or
//! its encoding changes every identity in the fact table.

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

use crate::record::UsageRecord;

/// Length of an `event_uuid` in hex characters.
pub const EVENT_UUID_LEN: usize = 32;

const FIELD_SEPARATOR: char = '\u{1f}';
const NULL_MARKER: &str = "\u{0}";

/// Compute the deterministic identity of a usage record.
pub fn event_uuid(record: &UsageRecord) -> String {
    let digest = Sha256::digest(canonical_form(record).as_bytes());
    hex::encode(&digest[..EVENT_UUID_LEN / 2])
}

/// The exact string that is hashed for a record.
pub fn canonical_form(record: &UsageRecord) -> String {
    let fields = [
        record.customer_id.map(|v| v.to_string()),
        record.event_start_time.as_ref().map(canonical_timestamp),
        record.event_type.clone(),
        record.rate_plan_id.map(|v| v.to_string()),
        record.duration.map(canonical_duration),
        record.charge.map(|v| v.normalize().to_string()),
    ];

    let mut out = String::with_capacity(96);
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(FIELD_SEPARATOR);
        }
        out.push_str(field.as_deref().unwrap_or(NULL_MARKER));
    }
    out
}

fn canonical_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn canonical_duration(v: f64) -> String {
    // -0.0 and 0.0 are the same duration
    if v == 0.0 {
        "0".to_string()
    } else {
        v.to_string()
    }
}
