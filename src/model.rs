//! Canonical data model shared by every pipeline stage.
//!
//! `IngestEnvelope` is produced by a log source (C1) and consumed exactly once
//! by the envelope parser (C3). `CanonicalLogRecord` is produced by C3,
//! consumed by the insert buffer (C4), and persisted by the store facade (C6).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One raw log line with its source tag, pre-parsing.
///
/// `line` is guaranteed by the producing source not to contain the framing
/// delimiter (`\n`) used on that transport.
#[derive(Debug, Clone)]
pub struct IngestEnvelope {
    /// Short tag identifying the transport this envelope arrived on, e.g. `"tcp"`, `"stdin"`.
    pub source: String,
    /// Raw payload of one record.
    pub line: Vec<u8>,
}

impl IngestEnvelope {
    pub fn new(source: impl Into<String>, line: Vec<u8>) -> Self {
        Self { source: source.into(), line }
    }
}

/// Closed set of normalized severity labels, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Severity {
    /// Canonical upper-case label, as stored in `CanonicalLogRecord::severity_label`.
    pub fn label(self) -> &'static str {
        match self {
            Severity::Trace => "TRACE",
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        }
    }

    /// The default `severity_number` used when a record carries a label but no
    /// explicit number, per spec.md §4.3's default table. This is *not* the
    /// numeric midpoint of the range; it is the table's literal value.
    pub fn default_number(self) -> u8 {
        match self {
            Severity::Trace => 1,
            Severity::Debug => 5,
            Severity::Info => 9,
            Severity::Warn => 13,
            Severity::Error => 17,
            Severity::Fatal => 21,
        }
    }

    /// Maps a `severityNumber` in `1..=24` to its severity bucket, per the
    /// OTLP-derived range table in spec.md §4.3. Returns `None` outside range.
    pub fn from_number(n: i64) -> Option<Severity> {
        match n {
            1..=4 => Some(Severity::Trace),
            5..=8 => Some(Severity::Debug),
            9..=12 => Some(Severity::Info),
            13..=16 => Some(Severity::Warn),
            17..=20 => Some(Severity::Error),
            21..=24 => Some(Severity::Fatal),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// The normalized, post-parse log record with enforced severity and attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalLogRecord {
    /// Wall-clock time the service observed the record.
    pub receive_timestamp: DateTime<Utc>,
    /// Nanoseconds since the Unix epoch, taken from the envelope. Zero if absent.
    pub origin_timestamp_nanos: i64,
    pub severity_label: Severity,
    pub severity_number: u8,
    pub message: String,
    /// Canonical re-serialization of the parsed envelope; falls back to the
    /// original line when re-serialization is not meaningful.
    pub raw_line: String,
    /// String-to-string attribute map; never contains an empty-string value.
    pub attributes: BTreeMap<String, String>,
    pub app: String,
    pub service: Option<String>,
    pub hostname: Option<String>,
    pub pid: Option<i64>,
    pub event_id: Option<String>,
    /// Source tag carried over from the `IngestEnvelope` this record came from.
    pub source: Option<String>,
}

impl CanonicalLogRecord {
    pub fn origin_timestamp(&self) -> Option<DateTime<Utc>> {
        if self.origin_timestamp_nanos == 0 {
            return None;
        }
        DateTime::from_timestamp(
            self.origin_timestamp_nanos / 1_000_000_000,
            (self.origin_timestamp_nanos % 1_000_000_000) as u32,
        )
    }
}

/// One `(seq, record)` pair as stored in the journal. `seq` is a strictly
/// monotonic 64-bit counter assigned by the journal at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub record: CanonicalLogRecord,
}
