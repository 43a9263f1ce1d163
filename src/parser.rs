//! Record parser for delimited usage exports.
//!
//! Two entry points:
//! - [`validate_structure`] checks the file exists, is non-empty and that the
//!   first few rows have the expected column count. Any failure here is
//!   structural and aborts the run before the store is touched.
//! - [`open_records`] returns a lazy [`UsageReader`] yielding one
//!   `Result<UsageRecord, RowError>` per data line. A malformed line is a
//!   row-level error; the caller decides whether to skip it.
//!
//! Fields follow the usual CSV quoting rules: a field opening with `"` runs
//! to its closing quote, may contain the delimiter, and writes a literal
//! quote as `""`. Records never span lines.
//!
//! Field semantics (negative durations, future timestamps) are not checked
//! here. That is the quality gate's job once rows are loaded.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::config::InputConfig;
use crate::record::{
    UsageRecord, CHARGE_INTEGER_DIGITS, CHARGE_SCALE, MAX_EVENT_TYPE_LEN, USAGE_COLUMNS,
};

/// Structural problems with the input file as a whole.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Input file '{path}' not found")]
    NotFound { path: PathBuf },

    #[error("Input file '{path}' is empty")]
    Empty { path: PathBuf },

    #[error("Input file '{path}' line {line}: expected {expected} columns, found {found}")]
    ColumnCount {
        path: PathBuf,
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("Input file '{path}' line {line}: unterminated quoted field")]
    UnterminatedQuote { path: PathBuf, line: usize },

    #[error("Failed to read input file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A single line that could not be turned into a record.
#[derive(Debug, thiserror::Error)]
#[error("line {line}: {kind}")]
pub struct RowError {
    pub line: usize,
    pub kind: RowErrorKind,
}

impl RowError {
    /// Read failures mean the rest of the file is unreachable.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, RowErrorKind::Io(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RowErrorKind {
    #[error("expected {expected} columns, found {found}")]
    ColumnCount { expected: usize, found: usize },

    #[error("invalid {column} '{value}': {reason}")]
    InvalidField {
        column: &'static str,
        value: String,
        reason: String,
    },

    #[error("unterminated quoted field")]
    UnterminatedQuote,

    #[error("not valid UTF-8: {0}")]
    Encoding(String),

    #[error("read failed: {0}")]
    Io(String),
}

/// What structure validation saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructureSummary {
    pub sampled_rows: usize,
}

/// Check that the input can be ingested at all.
pub fn validate_structure(path: &Path, input: &InputConfig) -> Result<StructureSummary, ParseError> {
    info!(path = %path.display(), "Validating input structure");

    let metadata = match std::fs::metadata(path) {
        Ok(m) if m.is_file() => m,
        Ok(_) => {
            return Err(ParseError::NotFound {
                path: path.to_path_buf(),
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ParseError::NotFound {
                path: path.to_path_buf(),
            })
        }
        Err(source) => {
            return Err(ParseError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if metadata.len() == 0 {
        return Err(ParseError::Empty {
            path: path.to_path_buf(),
        });
    }

    let file = File::open(path).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut sampled = 0;
    for (index, line) in data_lines(BufReader::new(file), input.has_header) {
        if sampled >= input.sample_rows {
            break;
        }
        // Encoding is a per-row problem; only the shape is checked here
        let line = match line {
            Ok(text) => text,
            Err(LineError::NotUtf8(e)) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
            Err(LineError::Io(source)) => {
                return Err(ParseError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let found = split_fields(&line, input.delimiter)
            .map_err(|_| ParseError::UnterminatedQuote {
                path: path.to_path_buf(),
                line: index,
            })?
            .len();
        if found != USAGE_COLUMNS {
            return Err(ParseError::ColumnCount {
                path: path.to_path_buf(),
                line: index,
                expected: USAGE_COLUMNS,
                found,
            });
        }
        sampled += 1;
    }

    info!(path = %path.display(), sampled_rows = sampled, "Input structure validated");
    Ok(StructureSummary {
        sampled_rows: sampled,
    })
}

/// Open the input for full ingestion.
pub fn open_records(path: &Path, input: &InputConfig) -> Result<UsageReader, ParseError> {
    let file = File::open(path).map_err(|source| match source.kind() {
        std::io::ErrorKind::NotFound => ParseError::NotFound {
            path: path.to_path_buf(),
        },
        _ => ParseError::Io {
            path: path.to_path_buf(),
            source,
        },
    })?;
    Ok(UsageReader::new(BufReader::new(file), input))
}

/// Lazy iterator over the records of a delimited source.
pub struct UsageReader {
    lines: Box<dyn Iterator<Item = RawLine> + Send>,
    delimiter: char,
}

impl UsageReader {
    pub fn new<R: BufRead + Send + 'static>(reader: R, input: &InputConfig) -> Self {
        Self {
            lines: Box::new(data_lines(reader, input.has_header)),
            delimiter: input.delimiter,
        }
    }
}

impl Iterator for UsageReader {
    type Item = Result<UsageRecord, RowError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (line_no, line) = self.lines.next()?;
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                let kind = match e {
                    LineError::Io(e) => RowErrorKind::Io(e.to_string()),
                    LineError::NotUtf8(e) => RowErrorKind::Encoding(e.utf8_error().to_string()),
                };
                return Some(Err(RowError { line: line_no, kind }));
            }
        };
        Some(
            parse_line(&line, self.delimiter)
                .map_err(|kind| RowError { line: line_no, kind }),
        )
    }
}

#[derive(Debug)]
enum LineError {
    Io(std::io::Error),
    NotUtf8(std::string::FromUtf8Error),
}

/// A 1-based line number and the line's text.
type RawLine = (usize, Result<String, LineError>);

/// Numbered, non-blank lines after the optional header.
///
/// Lines are read as bytes so one badly encoded line does not end the
/// iteration. A read error does: it is yielded once and nothing follows.
fn data_lines<R: BufRead + Send + 'static>(
    mut reader: R,
    has_header: bool,
) -> impl Iterator<Item = RawLine> + Send {
    let mut line_no = 0;
    let mut done = false;
    std::iter::from_fn(move || {
        if done {
            return None;
        }
        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => None,
            Ok(_) => {
                line_no += 1;
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                }
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
                Some((line_no, String::from_utf8(buf).map_err(LineError::NotUtf8)))
            }
            Err(e) => {
                done = true;
                line_no += 1;
                Some((line_no, Err(LineError::Io(e))))
            }
        }
    })
    .skip(usize::from(has_header))
    .filter(|(_, line)| !matches!(line, Ok(l) if l.trim().is_empty()))
}

/// Split one line into unquoted fields.
fn split_fields(line: &str, delimiter: char) -> Result<Vec<String>, RowErrorKind> {
    let mut fields = Vec::with_capacity(USAGE_COLUMNS);
    let mut field = String::new();
    let mut chars = line.chars().peekable();
    let mut at_field_start = true;
    let mut in_quotes = false;

    while let Some(c) = chars.next() {
        if in_quotes {
            if c != '"' {
                field.push(c);
            } else if chars.peek() == Some(&'"') {
                chars.next();
                field.push('"');
            } else {
                in_quotes = false;
            }
        } else if c == delimiter {
            fields.push(std::mem::take(&mut field));
            at_field_start = true;
            continue;
        } else if c == '"' && at_field_start {
            in_quotes = true;
        } else {
            field.push(c);
        }
        at_field_start = false;
    }

    if in_quotes {
        return Err(RowErrorKind::UnterminatedQuote);
    }
    fields.push(field);
    Ok(fields)
}

/// Parse one line into a record.
pub fn parse_line(line: &str, delimiter: char) -> Result<UsageRecord, RowErrorKind> {
    let raw = split_fields(line, delimiter)?;
    let fields: Vec<&str> = raw.iter().map(|f| f.trim()).collect();
    if fields.len() != USAGE_COLUMNS {
        return Err(RowErrorKind::ColumnCount {
            expected: USAGE_COLUMNS,
            found: fields.len(),
        });
    }

    Ok(UsageRecord {
        customer_id: parse_opt(fields[0], "customer_id", parse_i32)?,
        event_start_time: parse_opt(fields[1], "event_start_time", parse_timestamp)?,
        event_type: parse_opt(fields[2], "event_type", parse_event_type)?,
        rate_plan_id: parse_opt(fields[3], "rate_plan_id", parse_i32)?,
        billing_flag_one: parse_opt(fields[4], "billing_flag_one", parse_i32)?,
        billing_flag_two: parse_opt(fields[5], "billing_flag_two", parse_i32)?,
        duration: parse_opt(fields[6], "duration", parse_duration)?,
        charge: parse_opt(fields[7], "charge", parse_charge)?,
        month: parse_opt(fields[8], "month", parse_month)?,
    })
}

fn parse_opt<T>(
    value: &str,
    column: &'static str,
    parse: fn(&str) -> Result<T, String>,
) -> Result<Option<T>, RowErrorKind> {
    if value.is_empty() {
        return Ok(None);
    }
    parse(value)
        .map(Some)
        .map_err(|reason| RowErrorKind::InvalidField {
            column,
            value: value.to_string(),
            reason,
        })
}

fn parse_i32(value: &str) -> Result<i32, String> {
    value.parse::<i32>().map_err(|e| e.to_string())
}

const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%#z",
    "%Y-%m-%dT%H:%M:%S%.f%#z",
];

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Timestamps with an offset are converted to UTC; naive ones are taken as UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in OFFSET_FORMATS {
        if let Ok(ts) = DateTime::parse_from_str(value, format) {
            return Ok(ts.with_timezone(&Utc));
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(ts.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(ts) = date.and_hms_opt(0, 0, 0) {
            return Ok(ts.and_utc());
        }
    }
    debug!(value, "Unrecognised timestamp");
    Err("unrecognised timestamp format".to_string())
}

fn parse_event_type(value: &str) -> Result<String, String> {
    let len = value.chars().count();
    if len > MAX_EVENT_TYPE_LEN {
        return Err(format!(
            "{} characters exceeds limit of {}",
            len, MAX_EVENT_TYPE_LEN
        ));
    }
    Ok(value.to_string())
}

fn parse_duration(value: &str) -> Result<f64, String> {
    let v = value.parse::<f64>().map_err(|e| e.to_string())?;
    if !v.is_finite() {
        return Err("not a finite number".to_string());
    }
    Ok(v)
}

fn parse_charge(value: &str) -> Result<Decimal, String> {
    let v = Decimal::from_str(value).map_err(|e| e.to_string())?;
    let v = v.round_dp(CHARGE_SCALE);
    let limit = Decimal::from(10_i64.pow(CHARGE_INTEGER_DIGITS));
    if v.trunc().abs() >= limit {
        return Err(format!(
            "more than {} integer digits",
            CHARGE_INTEGER_DIGITS
        ));
    }
    Ok(v)
}

fn parse_month(value: &str) -> Result<String, String> {
    let shape_ok = value.len() == 7
        && value.as_bytes()[4] == b'-'
        && NaiveDate::parse_from_str(&format!("{}-01", value), "%Y-%m-%d").is_ok();
    if !shape_ok {
        return Err("expected YYYY-MM".to_string());
    }
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::{Cursor, Write};

    fn input() -> InputConfig {
        InputConfig::default()
    }

    const GOOD: &str = "1001,2024-03-05 10:15:00+00,VOICE,7,0,1,62.5,0.125,2024-03";

    #[test]
    fn test_parse_line_full_record() {
        let record = parse_line(GOOD, ',').unwrap();
        assert_eq!(record.customer_id, Some(1001));
        assert_eq!(
            record.event_start_time,
            Some(Utc.with_ymd_and_hms(2024, 3, 5, 10, 15, 0).unwrap())
        );
        assert_eq!(record.event_type.as_deref(), Some("VOICE"));
        assert_eq!(record.rate_plan_id, Some(7));
        assert_eq!(record.billing_flag_one, Some(0));
        assert_eq!(record.billing_flag_two, Some(1));
        assert_eq!(record.duration, Some(62.5));
        assert_eq!(record.charge, Some(Decimal::from_str("0.125").unwrap()));
        assert_eq!(record.month.as_deref(), Some("2024-03"));
    }

    #[test]
    fn test_empty_fields_are_null() {
        let record = parse_line(",2024-03-05 10:15:00,,,,,,,", ',').unwrap();
        assert_eq!(record.customer_id, None);
        assert!(record.event_start_time.is_some());
        assert_eq!(record.event_type, None);
        assert_eq!(record.charge, None);
        assert_eq!(record.month, None);
    }

    #[test]
    fn test_wrong_column_count_is_row_error() {
        let err = parse_line("1,2,3", ',').unwrap_err();
        assert!(matches!(
            err,
            RowErrorKind::ColumnCount {
                expected: 9,
                found: 3
            }
        ));
    }

    #[test]
    fn test_invalid_integer_names_column() {
        let line = "abc,2024-03-05 10:15:00,VOICE,7,0,1,62.5,0.125,2024-03";
        match parse_line(line, ',').unwrap_err() {
            RowErrorKind::InvalidField { column, value, .. } => {
                assert_eq!(column, "customer_id");
                assert_eq!(value, "abc");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 5, 10, 15, 0).unwrap();
        assert_eq!(parse_timestamp("2024-03-05T10:15:00Z").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-03-05 12:15:00+02:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-03-05 12:15:00+02").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-03-05 10:15:00").unwrap(), expected);
        assert_eq!(
            parse_timestamp("2024-03-05").unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap()
        );
        assert!(parse_timestamp("05/03/2024").is_err());
    }

    #[test]
    fn test_charge_rounds_to_eight_places() {
        let v = parse_charge("1.123456789").unwrap();
        assert_eq!(v, Decimal::from_str("1.12345679").unwrap());
        assert!(parse_charge("12345678901").is_err());
        assert!(parse_charge("9999999999.5").is_ok());
    }

    #[test]
    fn test_event_type_length_bound() {
        assert!(parse_event_type(&"X".repeat(50)).is_ok());
        assert!(parse_event_type(&"X".repeat(51)).is_err());
    }

    #[test]
    fn test_duration_must_be_finite() {
        assert!(parse_duration("NaN").is_err());
        assert!(parse_duration("inf").is_err());
        assert_eq!(parse_duration("-3").unwrap(), -3.0);
    }

    #[test]
    fn test_month_shape() {
        assert!(parse_month("2024-12").is_ok());
        assert!(parse_month("2024-13").is_err());
        assert!(parse_month("202412").is_err());
        assert!(parse_month("2024/12").is_err());
    }

    #[test]
    fn test_quoted_fields_are_unwrapped() {
        let line = "\"1001\",\"2024-03-05 10:15:00\",\"DATA\",7,0,1,1,0.5,\"2024-03\"";
        let record = parse_line(line, ',').unwrap();
        assert_eq!(record.event_type.as_deref(), Some("DATA"));
    }

    #[test]
    fn test_quoted_field_may_contain_delimiter() {
        let line = "1001,2024-03-05 10:15:00+00,\"VOICE, INTL\",7,0,1,62.5,0.125,2024-03";
        let record = parse_line(line, ',').unwrap();
        assert_eq!(record.event_type.as_deref(), Some("VOICE, INTL"));
        assert_eq!(record.rate_plan_id, Some(7));
        assert_eq!(record.month.as_deref(), Some("2024-03"));
    }

    #[test]
    fn test_doubled_quote_is_literal() {
        let line = "1001,2024-03-05 10:15:00+00,\"VO\"\"ICE\",7,0,1,62.5,0.125,2024-03";
        let record = parse_line(line, ',').unwrap();
        assert_eq!(record.event_type.as_deref(), Some("VO\"ICE"));
    }

    #[test]
    fn test_split_fields_quote_rules() {
        assert_eq!(split_fields("a;\"b;c\";", ';').unwrap(), vec!["a", "b;c", ""]);
        // A quote inside an unquoted field is ordinary text
        assert_eq!(split_fields("ab\"c,d", ',').unwrap(), vec!["ab\"c", "d"]);
        assert_eq!(split_fields("\"\",x", ',').unwrap(), vec!["", "x"]);
        assert!(matches!(
            split_fields("1,\"open", ','),
            Err(RowErrorKind::UnterminatedQuote)
        ));
    }

    #[test]
    fn test_invalid_utf8_line_is_skippable() {
        let mut data = GOOD.as_bytes().to_vec();
        data.extend_from_slice(b"\n1002,\xff\xfe,VOICE,7,0,1,1,0.5,2024-03\n");
        data.extend_from_slice(GOOD.as_bytes());
        data.push(b'\n');

        let results: Vec<_> = UsageReader::new(Cursor::new(data), &input()).collect();

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        let err = results[1].as_ref().unwrap_err();
        assert_eq!(err.line, 2);
        assert!(matches!(err.kind, RowErrorKind::Encoding(_)));
        assert!(!err.is_fatal());
        assert!(results[2].is_ok());
    }

    #[test]
    fn test_reader_numbers_lines_and_skips_blanks() {
        let data = format!("{GOOD}\n\nbroken\r\n{GOOD}\r\n");
        let reader = UsageReader::new(Cursor::new(data.into_bytes()), &input());
        let results: Vec<_> = reader.collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        let err = results[1].as_ref().unwrap_err();
        assert_eq!(err.line, 3);
        assert!(!err.is_fatal());
        assert!(results[2].is_ok());
    }

    #[test]
    fn test_reader_skips_header() {
        let data = format!("customer_id,a,b,c,d,e,f,g,h\n{GOOD}\n");
        let config = InputConfig {
            has_header: true,
            ..InputConfig::default()
        };
        let results: Vec<_> = UsageReader::new(Cursor::new(data.into_bytes()), &config).collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
    }

    #[test]
    fn test_validate_structure_missing_file() {
        let err = validate_structure(Path::new("/nonexistent/usage.csv"), &input()).unwrap_err();
        assert!(matches!(err, ParseError::NotFound { .. }));
    }

    #[test]
    fn test_validate_structure_empty_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = validate_structure(file.path(), &input()).unwrap_err();
        assert!(matches!(err, ParseError::Empty { .. }));
    }

    #[test]
    fn test_validate_structure_rejects_bad_sample() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{GOOD}").unwrap();
        writeln!(file, "1001,2024-03-05,VOICE").unwrap();
        let err = validate_structure(file.path(), &input()).unwrap_err();
        match err {
            ParseError::ColumnCount { line, found, .. } => {
                assert_eq!(line, 2);
                assert_eq!(found, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_validate_structure_counts_quoted_delimiter_once() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "1001,2024-03-05 10:15:00+00,\"VOICE, INTL\",7,0,1,62.5,0.125,2024-03"
        )
        .unwrap();
        let summary = validate_structure(file.path(), &input()).unwrap();
        assert_eq!(summary.sampled_rows, 1);
    }

    #[test]
    fn test_validate_structure_rejects_unterminated_quote() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{GOOD}").unwrap();
        writeln!(file, "1001,\"2024-03-05,VOICE,7,0,1,62.5,0.125,2024-03").unwrap();
        let err = validate_structure(file.path(), &input()).unwrap_err();
        assert!(matches!(err, ParseError::UnterminatedQuote { line: 2, .. }));
    }

    #[test]
    fn test_validate_structure_only_samples_leading_rows() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for _ in 0..5 {
            writeln!(file, "{GOOD}").unwrap();
        }
        writeln!(file, "short,row").unwrap();
        let summary = validate_structure(file.path(), &input()).unwrap();
        assert_eq!(summary.sampled_rows, 5);
    }
}
