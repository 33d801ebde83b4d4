//! Envelope parser (C3): decodes one ingest envelope's `line` into zero, one,
//! or many [`CanonicalLogRecord`]s.
//!
//! Mirrors the teacher's `parser/parser.rs` shape-detection style
//! (`detect_format` then a per-shape parser function) but decodes the
//! OTLP-derived JSON envelope shapes in spec.md §4.3 rather than
//! CRI/Docker/syslog text formats.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;

use crate::model::{CanonicalLogRecord, IngestEnvelope, Severity};

/// Attribute keys consulted, in order, to derive [`CanonicalLogRecord::app`].
const APP_KEYS: &[&str] = &["app", "service.name", "service_name", "service", "name"];

/// Parses one envelope, returning zero or more canonical records. Malformed
/// or unrecognized-shape input is silently dropped per spec.md §4.3/§7.
pub fn parse(envelope: &IngestEnvelope) -> Vec<CanonicalLogRecord> {
    let line = match std::str::from_utf8(&envelope.line) {
        Ok(s) => s,
        Err(err) => {
            tracing::trace!(error = %err, "dropping envelope: not valid utf-8");
            return Vec::new();
        }
    };
    let doc: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(err) => {
            tracing::trace!(error = %err, "dropping envelope: not valid json");
            return Vec::new();
        }
    };

    let shape = detect_shape(&doc);
    tracing::trace!(?shape, source = %envelope.source, "detected envelope shape");

    match shape {
        EnvelopeShape::ResourceLogs => parse_resource_logs(&doc, envelope, "resourceLogs"),
        EnvelopeShape::ScopeLogs(key) => parse_scope_logs(&doc, envelope, key),
        EnvelopeShape::BareLogRecords => parse_bare_log_records(&doc, envelope),
        EnvelopeShape::SingleRecord => {
            vec![build_record(&doc, &BTreeMap::new(), envelope)]
        }
        EnvelopeShape::Unrecognized => Vec::new(),
    }
}

#[derive(Debug)]
enum EnvelopeShape {
    ResourceLogs,
    ScopeLogs(&'static str),
    BareLogRecords,
    SingleRecord,
    Unrecognized,
}

/// Detects which of the shapes in spec.md §4.3 a decoded envelope matches, in
/// priority order.
fn detect_shape(doc: &Value) -> EnvelopeShape {
    if doc.get("resourceLogs").and_then(Value::as_array).is_some() {
        return EnvelopeShape::ResourceLogs;
    }
    if doc.get("scopeLogs").and_then(Value::as_array).is_some() {
        return EnvelopeShape::ScopeLogs("scopeLogs");
    }
    if doc.get("instrumentationLibraryLogs").and_then(Value::as_array).is_some() {
        return EnvelopeShape::ScopeLogs("instrumentationLibraryLogs");
    }
    if doc.get("logRecords").and_then(Value::as_array).is_some() {
        return EnvelopeShape::BareLogRecords;
    }
    const HEURISTIC_KEYS: &[&str] = &[
        "timeUnixNano",
        "observedTimeUnixNano",
        "severityNumber",
        "severityText",
        "traceId",
        "spanId",
        "flags",
        "droppedAttributesCount",
    ];
    if HEURISTIC_KEYS.iter().any(|k| doc.get(k).is_some()) {
        return EnvelopeShape::SingleRecord;
    }
    if doc.get("body").is_some() && doc.get("attributes").is_some() {
        return EnvelopeShape::SingleRecord;
    }
    EnvelopeShape::Unrecognized
}

fn parse_resource_logs(doc: &Value, envelope: &IngestEnvelope, key: &str) -> Vec<CanonicalLogRecord> {
    let mut out = Vec::new();
    let Some(groups) = doc.get(key).and_then(Value::as_array) else { return out };
    for resource_group in groups {
        let resource_attrs = flatten_attribute_list(
            resource_group.get("resource").and_then(|r| r.get("attributes")),
        );
        let scope_key = if resource_group.get("scopeLogs").is_some() { "scopeLogs" } else { "instrumentationLibraryLogs" };
        let Some(scope_groups) = resource_group.get(scope_key).and_then(Value::as_array) else { continue };
        for scope_group in scope_groups {
            out.extend(records_for_scope_group(scope_group, &resource_attrs, envelope));
        }
    }
    out
}

fn parse_scope_logs(doc: &Value, envelope: &IngestEnvelope, key: &str) -> Vec<CanonicalLogRecord> {
    let mut out = Vec::new();
    let Some(scope_groups) = doc.get(key).and_then(Value::as_array) else { return out };
    for scope_group in scope_groups {
        out.extend(records_for_scope_group(scope_group, &BTreeMap::new(), envelope));
    }
    out
}

fn parse_bare_log_records(doc: &Value, envelope: &IngestEnvelope) -> Vec<CanonicalLogRecord> {
    let Some(records) = doc.get("logRecords").and_then(Value::as_array) else { return Vec::new() };
    records.iter().map(|r| build_record(r, &BTreeMap::new(), envelope)).collect()
}

fn records_for_scope_group(
    scope_group: &Value,
    resource_attrs: &BTreeMap<String, String>,
    envelope: &IngestEnvelope,
) -> Vec<CanonicalLogRecord> {
    let mut merged = resource_attrs.clone();

    let scope = scope_group.get("scope").or_else(|| scope_group.get("instrumentationLibrary"));
    if let Some(scope) = scope {
        if let Some(name) = scope.get("name").and_then(Value::as_str) {
            if !name.is_empty() {
                merged.insert("otel.scope.name".to_string(), name.to_string());
            }
        }
        if let Some(version) = scope.get("version").and_then(Value::as_str) {
            if !version.is_empty() {
                merged.insert("otel.scope.version".to_string(), version.to_string());
            }
        }
    }

    let record_key = if scope_group.get("logRecords").is_some() { "logRecords" } else { "logs" };
    let Some(records) = scope_group.get(record_key).and_then(Value::as_array) else { return Vec::new() };
    records.iter().map(|r| build_record(r, &merged, envelope)).collect()
}

/// Builds one canonical record from a single OTLP-shape log record object,
/// merging in attributes inherited from enclosing resource/scope groups.
fn build_record(
    record: &Value,
    inherited_attrs: &BTreeMap<String, String>,
    envelope: &IngestEnvelope,
) -> CanonicalLogRecord {
    let mut attributes = inherited_attrs.clone();
    for (k, v) in flatten_attribute_list(record.get("attributes")) {
        attributes.insert(k, v);
    }

    let severity_label = normalize_severity(record);
    let severity_number = record
        .get("severityNumber")
        .and_then(Value::as_i64)
        .filter(|n| (1..=24).contains(n))
        .map(|n| n as u8)
        .unwrap_or_else(|| severity_label.default_number());

    let origin_timestamp_nanos = record
        .get("timeUnixNano")
        .or_else(|| record.get("observedTimeUnixNano"))
        .and_then(parse_nanos)
        .unwrap_or(0);

    let body_text = record.get("body").map(flatten_value).unwrap_or_default();
    let raw_line = serde_json::to_string(record).unwrap_or_default();
    let message = sanitize_message(if body_text.is_empty() { &raw_line } else { &body_text });

    let app = derive_app(&attributes);
    let service = attributes.get("service.name").or_else(|| attributes.get("service")).cloned();
    let hostname = attributes.get("host.name").or_else(|| attributes.get("hostname")).cloned();
    let pid = attributes.get("process.pid").and_then(|s| s.parse::<i64>().ok());
    let event_id = record.get("eventId").and_then(Value::as_str).map(str::to_string);

    CanonicalLogRecord {
        receive_timestamp: Utc::now(),
        origin_timestamp_nanos,
        severity_label,
        severity_number,
        message,
        raw_line,
        attributes,
        app,
        service,
        hostname,
        pid,
        event_id,
        source: Some(envelope.source.clone()),
    }
}

fn parse_nanos(value: &Value) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    if let Some(f) = value.as_f64() {
        return Some(f as i64);
    }
    if let Some(s) = value.as_str() {
        return s.parse::<i64>().ok().or_else(|| s.parse::<f64>().ok().map(|f| f as i64));
    }
    None
}

/// Flattens an OTLP attribute list (`[{key, value: {..tagged union..}}]`) into
/// a string-to-string map, per spec.md §4.3. Empty keys and empty stringified
/// values are dropped.
fn flatten_attribute_list(list: Option<&Value>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let Some(entries) = list.and_then(Value::as_array) else { return out };
    for entry in entries {
        let Some(key) = entry.get("key").and_then(Value::as_str) else { continue };
        if key.is_empty() {
            continue;
        }
        let Some(value) = entry.get("value") else { continue };
        let flattened = flatten_value(value);
        if flattened.is_empty() {
            continue;
        }
        out.insert(key.to_string(), flattened);
    }
    out
}

/// Flattens a tagged-union attribute value (or a plain scalar/body value) to
/// a single string.
fn flatten_value(value: &Value) -> String {
    if let Some(s) = value.get("stringValue").and_then(Value::as_str) {
        return s.to_string();
    }
    if let Some(b) = value.get("boolValue").and_then(Value::as_bool) {
        return b.to_string();
    }
    if let Some(i) = value.get("intValue") {
        return scalar_to_string(i);
    }
    if let Some(d) = value.get("doubleValue") {
        return scalar_to_string(d);
    }
    if let Some(b) = value.get("bytesValue") {
        return scalar_to_string(b);
    }
    if let Some(arr) = value.get("arrayValue").and_then(|a| a.get("values")).and_then(Value::as_array) {
        return arr.iter().map(flatten_value).filter(|s| !s.is_empty()).collect::<Vec<_>>().join(",");
    }
    if let Some(kv) = value.get("kvlistValue") {
        return serde_json::to_string(kv).unwrap_or_default();
    }

    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
        Value::Array(arr) => arr.iter().map(flatten_value).filter(|s| !s.is_empty()).collect::<Vec<_>>().join(","),
        other => scalar_to_string(other),
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => value.to_string(),
    }
}

fn sanitize_message(message: &str) -> String {
    message.replace(['\t', '\n', '\r'], " ")
}

fn derive_app(attributes: &BTreeMap<String, String>) -> String {
    for key in APP_KEYS {
        if let Some(value) = attributes.get(*key) {
            if !value.is_empty() {
                return value.clone();
            }
        }
    }
    "default".to_string()
}

/// Synonym table applied after upper-casing and trimming, per spec.md §4.3.
fn synonym(upper: &str) -> Option<&'static str> {
    match upper {
        "WARNING" => Some("WARN"),
        "CRITICAL" | "PANIC" => Some("FATAL"),
        "INF" => Some("INFO"),
        "WRN" => Some("WARN"),
        "ERR" => Some("ERROR"),
        "DBG" => Some("DEBUG"),
        "TRC" => Some("TRACE"),
        "CRIT" => Some("FATAL"),
        _ => None,
    }
}

fn label_from_prefix(upper: &str) -> Option<Severity> {
    match upper.get(0..4)? {
        "INFO" => Some(Severity::Info),
        "WARN" => Some(Severity::Warn),
        "ERRO" => Some(Severity::Error),
        "DEBU" => Some(Severity::Debug),
        "TRAC" => Some(Severity::Trace),
        "FATA" => Some(Severity::Fatal),
        "CRIT" => Some(Severity::Fatal),
        _ => None,
    }
}

fn label_from_str(raw: &str) -> Option<Severity> {
    let upper = raw.trim().to_uppercase();
    match upper.as_str() {
        "TRACE" => return Some(Severity::Trace),
        "DEBUG" => return Some(Severity::Debug),
        "INFO" => return Some(Severity::Info),
        "WARN" => return Some(Severity::Warn),
        "ERROR" => return Some(Severity::Error),
        "FATAL" => return Some(Severity::Fatal),
        _ => {}
    }
    if let Some(canon) = synonym(&upper) {
        return label_from_str(canon);
    }
    label_from_prefix(&upper)
}

/// Derives `severity_label` per spec.md §4.3: explicit `severityText` first,
/// then the `severityNumber` range table, then `INFO`.
fn normalize_severity(record: &Value) -> Severity {
    if let Some(text) = record.get("severityText").and_then(Value::as_str) {
        if let Some(label) = label_from_str(text) {
            return label;
        }
    }
    if let Some(number) = record.get("severityNumber").and_then(Value::as_i64) {
        if let Some(label) = Severity::from_number(number) {
            return label;
        }
    }
    Severity::Info
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(line: &str) -> IngestEnvelope {
        IngestEnvelope::new("tcp", line.as_bytes().to_vec())
    }

    #[test]
    fn drops_malformed_json() {
        assert!(parse(&envelope("not json")).is_empty());
    }

    #[test]
    fn parses_single_record_by_heuristic() {
        let line = r#"{"severityText":"Warn","body":{"stringValue":"disk low"},"attributes":[{"key":"app","value":{"stringValue":"payments"}}]}"#;
        let records = parse(&envelope(line));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].severity_label, Severity::Warn);
        assert_eq!(records[0].app, "payments");
        assert_eq!(records[0].message, "disk low");
    }

    #[test]
    fn parses_bare_log_records_batch() {
        let line = r#"{"logRecords":[{"severityText":"Error","body":{"stringValue":"a"}},{"severityText":"Info","body":{"stringValue":"b"}}]}"#;
        let records = parse(&envelope(line));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].severity_label, Severity::Error);
        assert_eq!(records[1].severity_label, Severity::Info);
    }

    #[test]
    fn resource_and_scope_attributes_merge_with_record_winning() {
        let line = r#"{"resourceLogs":[{"resource":{"attributes":[{"key":"app","value":{"stringValue":"resource-app"}}]},"scopeLogs":[{"scope":{"name":"scope-a","version":"1.0"},"logRecords":[{"severityText":"Info","body":{"stringValue":"hi"},"attributes":[{"key":"app","value":{"stringValue":"record-app"}}]}]}]}]}"#;
        let records = parse(&envelope(line));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].app, "record-app");
        assert_eq!(records[0].attributes.get("otel.scope.name"), Some(&"scope-a".to_string()));
    }

    #[test]
    fn default_app_when_absent() {
        let line = r#"{"severityText":"Info","body":{"stringValue":"hi"}}"#;
        let records = parse(&envelope(line));
        assert_eq!(records[0].app, "default");
    }

    #[test]
    fn severity_synonyms_normalize() {
        assert_eq!(label_from_str("WARNING"), Some(Severity::Warn));
        assert_eq!(label_from_str("critical"), Some(Severity::Fatal));
        assert_eq!(label_from_str("ERR"), Some(Severity::Error));
        assert_eq!(label_from_str("unknown-garbage"), None);
    }

    #[test]
    fn severity_number_range_table() {
        assert_eq!(Severity::from_number(3), Some(Severity::Trace));
        assert_eq!(Severity::from_number(9), Some(Severity::Info));
        assert_eq!(Severity::from_number(24), Some(Severity::Fatal));
        assert_eq!(Severity::from_number(0), None);
    }

    #[test]
    fn message_sanitized() {
        let line = r#"{"severityText":"Info","body":{"stringValue":"line1\nline2\ttab"}}"#;
        let records = parse(&envelope(line));
        assert_eq!(records[0].message, "line1 line2 tab");
    }

    #[test]
    fn array_and_kvlist_attributes_flatten() {
        let line = r#"{"severityText":"Info","body":{"stringValue":"hi"},"attributes":[{"key":"tags","value":{"arrayValue":{"values":[{"stringValue":"a"},{"stringValue":"b"}]}}},{"key":"meta","value":{"kvlistValue":{"values":[{"key":"x","value":{"stringValue":"y"}}]}}}]}"#;
        let records = parse(&envelope(line));
        assert_eq!(records[0].attributes.get("tags"), Some(&"a,b".to_string()));
        assert!(records[0].attributes.contains_key("meta"));
    }
}
