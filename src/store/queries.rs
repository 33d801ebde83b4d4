//! SQL implementations backing the [`super::Store`] facade's public methods.
//! Kept separate from connection/pool management so the query suite in
//! spec.md §6.3 reads as one list.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, Row as SqlRow};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::StoreError;
use crate::model::{CanonicalLogRecord, Severity};

/// Common query scoping parameter. Empty `app` means "all apps", per spec.md §6.3.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryOpts {
    #[serde(default)]
    pub app: String,
}

/// One row of a dynamic [`QueryResult`] — a mapping from column name to a
/// JSON-typed value, per the design note in spec.md §9.
pub type Row = BTreeMap<String, JsonValue>;

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub row_count: usize,
}

pub fn insert_batch(
    writer: &Arc<Mutex<Connection>>,
    records: &[(u64, CanonicalLogRecord)],
) -> Result<(), StoreError> {
    let mut conn = writer.lock().unwrap_or_else(|poison| poison.into_inner());
    let tx = conn.transaction()?;
    {
        let mut insert_log = tx.prepare(
            "INSERT INTO logs (seq, receive_timestamp, origin_timestamp_nanos, severity_label,
                severity_number, message, raw_line, attributes, app, service, hostname, pid,
                event_id, source)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
        )?;
        let mut insert_attr =
            tx.prepare("INSERT INTO log_attributes (log_id, key, value) VALUES (?1,?2,?3)")?;

        for (seq, record) in records {
            let attributes_json = serde_json::to_string(&record.attributes).unwrap_or_default();
            insert_log.execute(params![
                *seq as i64,
                record.receive_timestamp.to_rfc3339(),
                record.origin_timestamp_nanos,
                record.severity_label.label(),
                record.severity_number,
                record.message,
                record.raw_line,
                attributes_json,
                record.app,
                record.service,
                record.hostname,
                record.pid,
                record.event_id,
                record.source,
            ])?;
            let log_id = tx.last_insert_rowid();
            for (key, value) in &record.attributes {
                insert_attr.execute(params![log_id, key, value])?;
            }
        }
    }
    tx.commit()?;
    crate::metrics::RECORDS_INGESTED_TOTAL.inc_by(records.len() as u64);
    Ok(())
}

/// Whole-word, case-insensitive tokens that make a statement non-read-only,
/// per spec.md §4.9's SQL gate.
const FORBIDDEN_TOKENS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "TRUNCATE", "ALTER", "CREATE", "COPY", "ATTACH",
    "DETACH", "PRAGMA", "EXPORT", "IMPORT", "LOAD", "INSTALL",
];

/// Rejects any statement containing a forbidden token as a whole word, or any
/// `;`, outside of checking string-literal context — spec.md's "simplest
/// compliant implementation" of forbidding `;` entirely.
pub fn check_sql_gate(sql: &str) -> Result<(), StoreError> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err(StoreError::Rejected("empty SQL".to_string()));
    }
    if trimmed.contains(';') {
        return Err(StoreError::Rejected("statement separators are not permitted".to_string()));
    }
    let upper = trimmed.to_uppercase();
    for token in FORBIDDEN_TOKENS {
        if contains_whole_word(&upper, token) {
            return Err(StoreError::Rejected(format!("statement contains forbidden keyword {token}")));
        }
    }
    Ok(())
}

fn contains_whole_word(haystack: &str, word: &str) -> bool {
    let bytes = haystack.as_bytes();
    let word_bytes = word.as_bytes();
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(word) {
        let abs = start + pos;
        let before_ok = abs == 0 || !bytes[abs - 1].is_ascii_alphanumeric() && bytes[abs - 1] != b'_';
        let after = abs + word_bytes.len();
        let after_ok = after >= bytes.len() || (!bytes[after].is_ascii_alphanumeric() && bytes[after] != b'_');
        if before_ok && after_ok {
            return true;
        }
        start = abs + 1;
    }
    false
}

pub fn execute_sql(conn: &Connection, sql: &str) -> Result<QueryResult, StoreError> {
    check_sql_gate(sql)?;
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let rows = stmt.query_map([], |row| Ok(row_to_map(row, &columns)))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(QueryResult { row_count: out.len(), columns, rows: out })
}

fn row_to_map(row: &SqlRow, columns: &[String]) -> Row {
    let mut map = Row::new();
    for (i, name) in columns.iter().enumerate() {
        let value = match row.get_ref(i) {
            Ok(rusqlite::types::ValueRef::Null) => JsonValue::Null,
            Ok(rusqlite::types::ValueRef::Integer(n)) => JsonValue::from(n),
            Ok(rusqlite::types::ValueRef::Real(f)) => {
                serde_json::Number::from_f64(f).map(JsonValue::Number).unwrap_or(JsonValue::Null)
            }
            Ok(rusqlite::types::ValueRef::Text(t)) => {
                JsonValue::String(String::from_utf8_lossy(t).to_string())
            }
            Ok(rusqlite::types::ValueRef::Blob(b)) => JsonValue::String(format!("<{} bytes>", b.len())),
            Err(_) => JsonValue::Null,
        };
        map.insert(name.clone(), value);
    }
    map
}

pub fn schema_description(conn: &Connection) -> Result<String, StoreError> {
    let mut stmt = conn.prepare("SELECT sql FROM sqlite_master WHERE type='table' AND sql IS NOT NULL")?;
    let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
    let mut parts = Vec::new();
    for row in rows {
        parts.push(row?);
    }
    Ok(parts.join(";\n"))
}

pub fn table_row_counts(conn: &Connection) -> Result<Vec<(String, i64)>, StoreError> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='table'")?;
    let names: Vec<String> = stmt.query_map([], |r| r.get(0))?.collect::<Result<_, _>>()?;
    let mut out = Vec::new();
    for name in names {
        let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {name}"), [], |r| r.get(0))?;
        out.push((name, count));
    }
    Ok(out)
}

fn app_clause(opts: &QueryOpts) -> (&'static str, Vec<String>) {
    if opts.app.is_empty() {
        ("", Vec::new())
    } else {
        (" WHERE app = ?1", vec![opts.app.clone()])
    }
}

pub fn total_log_count(conn: &Connection, opts: &QueryOpts) -> Result<i64, StoreError> {
    let (clause, args) = app_clause(opts);
    let sql = format!("SELECT COUNT(*) FROM logs{clause}");
    Ok(conn.query_row(&sql, params_from_iter(args), |r| r.get(0))?)
}

pub fn total_log_bytes(conn: &Connection, opts: &QueryOpts) -> Result<i64, StoreError> {
    let (clause, args) = app_clause(opts);
    let sql = format!("SELECT COALESCE(SUM(LENGTH(raw_line)), 0) FROM logs{clause}");
    Ok(conn.query_row(&sql, params_from_iter(args), |r| r.get(0))?)
}

pub fn top_words(conn: &Connection, limit: usize, opts: &QueryOpts) -> Result<Vec<(String, i64)>, StoreError> {
    let (clause, args) = app_clause(opts);
    let sql = format!("SELECT message FROM logs{clause}");
    let mut stmt = conn.prepare(&sql)?;
    let messages = stmt.query_map(params_from_iter(args), |r| r.get::<_, String>(0))?;

    let mut counts: BTreeMap<String, i64> = BTreeMap::new();
    for message in messages {
        let message = message?;
        for word in message.split_whitespace() {
            let normalized = word.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase();
            if normalized.len() < 3 {
                continue;
            }
            *counts.entry(normalized).or_insert(0) += 1;
        }
    }
    let mut out: Vec<(String, i64)> = counts.into_iter().collect();
    out.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    out.truncate(limit);
    Ok(out)
}

pub fn top_attributes(
    conn: &Connection,
    limit: usize,
    opts: &QueryOpts,
) -> Result<Vec<(String, String, i64)>, StoreError> {
    let (join_clause, mut args) = if opts.app.is_empty() {
        ("", Vec::new())
    } else {
        (" JOIN logs ON logs.id = log_attributes.log_id WHERE logs.app = ?1", vec![opts.app.clone()])
    };
    args.push(limit.to_string());
    let limit_idx = args.len();
    let sql = format!(
        "SELECT key, value, COUNT(*) AS c FROM log_attributes{join_clause}
         GROUP BY key, value ORDER BY c DESC LIMIT ?{limit_idx}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(args), |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, i64>(2)?))
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn top_attribute_keys(
    conn: &Connection,
    limit: usize,
    opts: &QueryOpts,
) -> Result<Vec<(String, i64, i64)>, StoreError> {
    let (join_clause, mut args) = if opts.app.is_empty() {
        ("", Vec::new())
    } else {
        (" JOIN logs ON logs.id = log_attributes.log_id WHERE logs.app = ?1", vec![opts.app.clone()])
    };
    args.push(limit.to_string());
    let limit_idx = args.len();
    let sql = format!(
        "SELECT key, COUNT(DISTINCT value) AS unique_values, COUNT(*) AS total_count
         FROM log_attributes{join_clause}
         GROUP BY key ORDER BY total_count DESC LIMIT ?{limit_idx}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(args), |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?))
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn attribute_key_values(conn: &Connection, key: &str, limit: usize) -> Result<Vec<(String, i64)>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT value, COUNT(*) AS c FROM log_attributes WHERE key = ?1 GROUP BY value ORDER BY c DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![key, limit as i64], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn severity_counts(conn: &Connection, opts: &QueryOpts) -> Result<Vec<(String, i64)>, StoreError> {
    let (clause, args) = app_clause(opts);
    let sql = format!("SELECT severity_label, COUNT(*) FROM logs{clause} GROUP BY severity_label");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(args), |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

#[derive(Debug, Clone, Serialize)]
pub struct MinuteBucket {
    pub minute: String,
    pub counts: BTreeMap<String, i64>,
    pub total: i64,
}

pub fn severity_counts_by_minute(
    conn: &Connection,
    window_minutes: i64,
    opts: &QueryOpts,
) -> Result<Vec<MinuteBucket>, StoreError> {
    let cutoff = Utc::now() - chrono::Duration::minutes(window_minutes.max(1));
    let (app_filter, mut args) = if opts.app.is_empty() {
        (String::new(), Vec::new())
    } else {
        (" AND app = ?2".to_string(), vec![opts.app.clone()])
    };
    args.insert(0, cutoff.to_rfc3339());
    let sql = format!(
        "SELECT substr(receive_timestamp, 1, 16) AS minute, severity_label, COUNT(*) AS c
         FROM logs WHERE receive_timestamp >= ?1{app_filter}
         GROUP BY minute, severity_label ORDER BY minute ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(args), |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, i64>(2)?))
    })?;

    let mut buckets: BTreeMap<String, MinuteBucket> = BTreeMap::new();
    for row in rows {
        let (minute, label, count) = row?;
        let bucket = buckets.entry(minute.clone()).or_insert_with(|| MinuteBucket {
            minute,
            counts: BTreeMap::new(),
            total: 0,
        });
        *bucket.counts.entry(label).or_insert(0) += count;
        bucket.total += count;
    }
    Ok(buckets.into_values().collect())
}

pub fn top_hosts(conn: &Connection, limit: usize, opts: &QueryOpts) -> Result<Vec<(String, i64)>, StoreError> {
    top_nonnull_column(conn, "hostname", limit, opts)
}

pub fn top_services(conn: &Connection, limit: usize, opts: &QueryOpts) -> Result<Vec<(String, i64)>, StoreError> {
    top_nonnull_column(conn, "service", limit, opts)
}

fn top_nonnull_column(
    conn: &Connection,
    column: &str,
    limit: usize,
    opts: &QueryOpts,
) -> Result<Vec<(String, i64)>, StoreError> {
    let (app_filter, mut args) = if opts.app.is_empty() {
        (String::new(), Vec::new())
    } else {
        (" AND app = ?1".to_string(), vec![opts.app.clone()])
    };
    args.push(limit.to_string());
    let limit_idx = args.len();
    let sql = format!(
        "SELECT {column}, COUNT(*) AS c FROM logs WHERE {column} IS NOT NULL{app_filter}
         GROUP BY {column} ORDER BY c DESC LIMIT ?{limit_idx}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(args), |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn top_services_by_severity(
    conn: &Connection,
    severity: &str,
    limit: usize,
    opts: &QueryOpts,
) -> Result<Vec<(String, i64)>, StoreError> {
    let (app_filter, mut args) = if opts.app.is_empty() {
        (String::new(), vec![severity.to_uppercase()])
    } else {
        (" AND app = ?2".to_string(), vec![severity.to_uppercase(), opts.app.clone()])
    };
    args.push(limit.to_string());
    let limit_idx = args.len();
    let sql = format!(
        "SELECT service, COUNT(*) AS c FROM logs WHERE service IS NOT NULL AND severity_label = ?1{app_filter}
         GROUP BY service ORDER BY c DESC LIMIT ?{limit_idx}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(args), |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn list_apps(conn: &Connection) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare("SELECT DISTINCT app FROM logs ORDER BY app")?;
    let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecentLogsParams {
    pub limit: usize,
    pub app: String,
    pub severity_levels: Vec<String>,
    pub message_pattern: String,
}

pub fn recent_logs_filtered(
    conn: &Connection,
    params: &RecentLogsParams,
) -> Result<Vec<CanonicalLogRecord>, StoreError> {
    let mut clauses = Vec::new();
    let mut args: Vec<String> = Vec::new();

    if !params.app.is_empty() {
        args.push(params.app.clone());
        clauses.push(format!("app = ?{}", args.len()));
    }
    if !params.severity_levels.is_empty() {
        let placeholders: Vec<String> = params
            .severity_levels
            .iter()
            .map(|level| {
                args.push(level.to_uppercase());
                format!("?{}", args.len())
            })
            .collect();
        clauses.push(format!("severity_label IN ({})", placeholders.join(",")));
    }
    if !params.message_pattern.is_empty() {
        args.push(format!("%{}%", params.message_pattern));
        clauses.push(format!("message LIKE ?{}", args.len()));
    }

    let where_clause = if clauses.is_empty() { String::new() } else { format!("WHERE {}", clauses.join(" AND ")) };
    args.push(params.limit.to_string());
    let limit_idx = args.len();
    let sql = format!(
        "SELECT receive_timestamp, origin_timestamp_nanos, severity_label, severity_number, message,
                raw_line, attributes, app, service, hostname, pid, event_id, source
         FROM logs {where_clause} ORDER BY receive_timestamp DESC LIMIT ?{limit_idx}"
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(args), row_to_record)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn row_to_record(row: &SqlRow) -> rusqlite::Result<CanonicalLogRecord> {
    let receive_timestamp: String = row.get(0)?;
    let severity_label: String = row.get(2)?;
    let attributes_json: String = row.get(6)?;
    Ok(CanonicalLogRecord {
        receive_timestamp: DateTime::parse_from_rfc3339(&receive_timestamp)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        origin_timestamp_nanos: row.get(1)?,
        severity_label: label_from_stored(&severity_label),
        severity_number: row.get(3)?,
        message: row.get(4)?,
        raw_line: row.get(5)?,
        attributes: serde_json::from_str(&attributes_json).unwrap_or_default(),
        app: row.get(7)?,
        service: row.get(8)?,
        hostname: row.get(9)?,
        pid: row.get(10)?,
        event_id: row.get(11)?,
        source: row.get(12)?,
    })
}

fn label_from_stored(label: &str) -> Severity {
    match label {
        "TRACE" => Severity::Trace,
        "DEBUG" => Severity::Debug,
        "WARN" => Severity::Warn,
        "ERROR" => Severity::Error,
        "FATAL" => Severity::Fatal,
        _ => Severity::Info,
    }
}

pub fn snapshot_to(writer: &Arc<Mutex<Connection>>, path: &Path) -> Result<(), StoreError> {
    let conn = writer.lock().unwrap_or_else(|poison| poison.into_inner());
    let path_str = path.to_string_lossy().replace('\'', "''");
    conn.execute_batch(&format!("VACUUM INTO '{path_str}'"))?;
    Ok(())
}

pub fn delete_older_than(writer: &Arc<Mutex<Connection>>, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
    let conn = writer.lock().unwrap_or_else(|poison| poison.into_inner());
    let deleted = conn.execute("DELETE FROM logs WHERE receive_timestamp < ?1", params![cutoff.to_rfc3339()])?;
    conn.execute(
        "DELETE FROM log_attributes WHERE log_id NOT IN (SELECT id FROM logs)",
        [],
    )?;
    Ok(deleted as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_gate_rejects_forbidden_keywords() {
        assert!(check_sql_gate("SELECT 1; DROP TABLE logs").is_err());
        assert!(check_sql_gate("DROP TABLE logs").is_err());
        assert!(check_sql_gate("SELECT * FROM logs WHERE app = 'dropship'").is_ok());
    }

    #[test]
    fn sql_gate_rejects_empty() {
        assert!(check_sql_gate("").is_err());
        assert!(check_sql_gate("   ").is_err());
    }

    #[test]
    fn sql_gate_allows_select_and_cte() {
        assert!(check_sql_gate("SELECT COUNT(*) FROM logs").is_ok());
        assert!(check_sql_gate("WITH c AS (SELECT COUNT(*) AS n FROM logs) SELECT n FROM c").is_ok());
    }

    #[test]
    fn sql_gate_rejects_semicolon_even_without_keyword() {
        assert!(check_sql_gate("SELECT 1; SELECT 2").is_err());
    }
}
