//! Store facade (C6): a narrow query/insert/snapshot contract over an
//! embedded analytical engine, per spec.md §4.6.
//!
//! spec.md treats the engine as an opaque dependency with a fixed contract
//! (serializable batch inserts, consistent point-in-time reads, snapshot-to-file).
//! We satisfy that contract with the teacher's own persistence stack —
//! `r2d2`-pooled `rusqlite` — rather than inventing a new dependency: a single
//! dedicated writer connection serializes inserts/deletes/snapshots, and a
//! pooled, semaphore-gated set of reader connections back every query.

mod queries;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tokio::sync::Semaphore;
use tracing::instrument;

use crate::error::StoreError;
use crate::model::CanonicalLogRecord;

pub use queries::{QueryOpts, QueryResult, RecentLogsParams, Row};

/// URI naming the shared-cache in-memory database used when `db_path` is
/// `None`. A bare `:memory:` connection is private to the connection that
/// opened it; every reader-pool connection would see an empty, schema-less
/// database. The `cache=shared` URI form (with `SQLITE_OPEN_URI`) makes every
/// connection opened against this name share the same in-memory database for
/// the life of the process, as long as at least one connection stays open —
/// which the writer, held for the lifetime of the `Store`, guarantees.
const MEMORY_URI: &str = "file::memory:?cache=shared";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS logs (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    seq                     INTEGER NOT NULL,
    receive_timestamp       TEXT NOT NULL,
    origin_timestamp_nanos  INTEGER NOT NULL,
    severity_label          TEXT NOT NULL,
    severity_number         INTEGER NOT NULL,
    message                 TEXT NOT NULL,
    raw_line                TEXT NOT NULL,
    attributes              TEXT NOT NULL,
    app                     TEXT NOT NULL,
    service                 TEXT,
    hostname                TEXT,
    pid                     INTEGER,
    event_id                TEXT,
    source                  TEXT
);
CREATE INDEX IF NOT EXISTS idx_logs_app ON logs(app);
CREATE INDEX IF NOT EXISTS idx_logs_severity ON logs(severity_label);
CREATE INDEX IF NOT EXISTS idx_logs_receive_timestamp ON logs(receive_timestamp);
CREATE TABLE IF NOT EXISTS log_attributes (
    log_id  INTEGER NOT NULL REFERENCES logs(id),
    key     TEXT NOT NULL,
    value   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_log_attributes_key ON log_attributes(key);
CREATE INDEX IF NOT EXISTS idx_log_attributes_key_value ON log_attributes(key, value);
";

/// Narrow facade over the embedded store, satisfying spec.md §4.6.
#[derive(Clone)]
pub struct Store {
    writer: Arc<Mutex<Connection>>,
    reader_pool: Pool<SqliteConnectionManager>,
    gate: Arc<RwLock<Arc<Semaphore>>>,
    query_timeout: Duration,
    db_path: Option<PathBuf>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("db_path", &self.db_path).finish()
    }
}

impl Store {
    /// Opens the store at `db_path` (or an in-memory database when `None`),
    /// running migrations and building the reader pool + writer connection.
    #[instrument(name = "store::open", skip_all, level = "info")]
    pub fn open(
        db_path: Option<&Path>,
        max_concurrent_queries: usize,
        query_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let writer = match db_path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_with_flags(
                MEMORY_URI,
                rusqlite::OpenFlags::SQLITE_OPEN_URI
                    | rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE,
            )?,
        };
        writer.execute_batch(SCHEMA)?;

        let manager = match db_path {
            Some(path) => SqliteConnectionManager::file(path).with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            ),
            None => SqliteConnectionManager::file(MEMORY_URI)
                .with_flags(rusqlite::OpenFlags::SQLITE_OPEN_URI | rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY),
        };
        let reader_pool = Pool::builder().max_size(max_concurrent_queries.max(1) as u32).build(manager)?;

        tracing::info!(?db_path, max_concurrent_queries, "store opened");

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            reader_pool,
            gate: Arc::new(RwLock::new(Arc::new(Semaphore::new(max_concurrent_queries.max(1))))),
            query_timeout,
            db_path: db_path.map(Path::to_path_buf),
        })
    }

    /// Atomic batch insert; all-or-nothing at the batch level.
    #[instrument(name = "store::insert_batch", skip_all, level = "debug", fields(count = records.len()))]
    pub async fn insert_batch(&self, records: Vec<(u64, CanonicalLogRecord)>) -> Result<(), StoreError> {
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || queries::insert_batch(&writer, &records))
            .await
            .map_err(StoreError::from_join)?
    }

    /// Runs a read-only SQL statement through the reader gate, bounded by the
    /// configured per-query timeout.
    #[instrument(name = "store::execute_sql", skip_all, level = "debug")]
    pub async fn execute_sql(&self, sql: &str) -> Result<QueryResult, StoreError> {
        self.gated(move |conn| queries::execute_sql(conn, &sql)).await
    }

    pub async fn schema_description(&self) -> Result<String, StoreError> {
        self.gated(|conn| queries::schema_description(conn)).await
    }

    pub async fn table_row_counts(&self) -> Result<Vec<(String, i64)>, StoreError> {
        self.gated(|conn| queries::table_row_counts(conn)).await
    }

    pub async fn total_log_count(&self, opts: QueryOpts) -> Result<i64, StoreError> {
        self.gated(move |conn| queries::total_log_count(conn, &opts)).await
    }

    pub async fn total_log_bytes(&self, opts: QueryOpts) -> Result<i64, StoreError> {
        self.gated(move |conn| queries::total_log_bytes(conn, &opts)).await
    }

    pub async fn top_words(&self, limit: usize, opts: QueryOpts) -> Result<Vec<(String, i64)>, StoreError> {
        self.gated(move |conn| queries::top_words(conn, limit, &opts)).await
    }

    pub async fn top_attributes(
        &self,
        limit: usize,
        opts: QueryOpts,
    ) -> Result<Vec<(String, String, i64)>, StoreError> {
        self.gated(move |conn| queries::top_attributes(conn, limit, &opts)).await
    }

    pub async fn top_attribute_keys(
        &self,
        limit: usize,
        opts: QueryOpts,
    ) -> Result<Vec<(String, i64, i64)>, StoreError> {
        self.gated(move |conn| queries::top_attribute_keys(conn, limit, &opts)).await
    }

    pub async fn attribute_key_values(
        &self,
        key: String,
        limit: usize,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        self.gated(move |conn| queries::attribute_key_values(conn, &key, limit)).await
    }

    pub async fn severity_counts(&self, opts: QueryOpts) -> Result<Vec<(String, i64)>, StoreError> {
        self.gated(move |conn| queries::severity_counts(conn, &opts)).await
    }

    pub async fn severity_counts_by_minute(
        &self,
        window_minutes: i64,
        opts: QueryOpts,
    ) -> Result<Vec<queries::MinuteBucket>, StoreError> {
        self.gated(move |conn| queries::severity_counts_by_minute(conn, window_minutes, &opts)).await
    }

    pub async fn top_hosts(&self, limit: usize, opts: QueryOpts) -> Result<Vec<(String, i64)>, StoreError> {
        self.gated(move |conn| queries::top_hosts(conn, limit, &opts)).await
    }

    pub async fn top_services(&self, limit: usize, opts: QueryOpts) -> Result<Vec<(String, i64)>, StoreError> {
        self.gated(move |conn| queries::top_services(conn, limit, &opts)).await
    }

    pub async fn top_services_by_severity(
        &self,
        severity: String,
        limit: usize,
        opts: QueryOpts,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        self.gated(move |conn| queries::top_services_by_severity(conn, &severity, limit, &opts)).await
    }

    pub async fn list_apps(&self) -> Result<Vec<String>, StoreError> {
        self.gated(|conn| queries::list_apps(conn)).await
    }

    pub async fn recent_logs_filtered(
        &self,
        params: queries::RecentLogsParams,
    ) -> Result<Vec<CanonicalLogRecord>, StoreError> {
        self.gated(move |conn| queries::recent_logs_filtered(conn, &params)).await
    }

    /// Produces a consistent snapshot at `path` via `VACUUM INTO`, which
    /// SQLite guarantees is consistent with concurrent readers.
    #[instrument(name = "store::snapshot_to", skip_all, level = "info")]
    pub async fn snapshot_to(&self, path: PathBuf) -> Result<(), StoreError> {
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || queries::snapshot_to(&writer, &path))
            .await
            .map_err(StoreError::from_join)?
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Adjusts the reader concurrency gate. In-flight queries keep the
    /// semaphore they acquired; only subsequent calls observe the new limit.
    pub fn set_max_concurrent_queries(&self, n: usize) {
        let mut gate = self.gate.write().unwrap_or_else(|poison| poison.into_inner());
        *gate = Arc::new(Semaphore::new(n.max(1)));
    }

    /// Deletes records whose `receive_timestamp` is older than `older_than`,
    /// returning the number of rows removed. Used by the retention cleaner (C7).
    #[instrument(name = "store::delete_older_than", skip_all, level = "debug")]
    pub async fn delete_older_than(&self, older_than: Duration) -> Result<u64, StoreError> {
        let writer = self.writer.clone();
        let cutoff = chrono::Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        tokio::task::spawn_blocking(move || queries::delete_older_than(&writer, cutoff))
            .await
            .map_err(StoreError::from_join)?
    }

    async fn gated<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let gate_started = std::time::Instant::now();
        let semaphore = self.gate.read().unwrap_or_else(|poison| poison.into_inner()).clone();
        let _permit = semaphore.acquire_owned().await.map_err(|_| StoreError::Rejected("gate closed".to_string()))?;
        crate::metrics::GATE_WAIT_SECONDS.observe(gate_started.elapsed().as_secs_f64());

        let pool = self.reader_pool.clone();
        let query_started = std::time::Instant::now();
        let fut = async move {
            tokio::task::spawn_blocking(move || {
                let conn = pool.get()?;
                f(&conn)
            })
            .await
            .map_err(StoreError::from_join)?
        };

        let result = tokio::time::timeout(self.query_timeout, fut).await.map_err(|_| StoreError::Timeout)?;
        crate::metrics::QUERY_DURATION_SECONDS.observe(query_started.elapsed().as_secs_f64());
        result
    }
}

impl StoreError {
    fn from_join(err: tokio::task::JoinError) -> Self {
        StoreError::Rejected(format!("worker task failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Severity;
    use std::collections::BTreeMap;

    fn sample(seq: u64, app: &str, severity: Severity) -> (u64, CanonicalLogRecord) {
        let mut attrs = BTreeMap::new();
        attrs.insert("env".to_string(), "prod".to_string());
        (
            seq,
            CanonicalLogRecord {
                receive_timestamp: chrono::Utc::now(),
                origin_timestamp_nanos: 0,
                severity_label: severity,
                severity_number: severity.default_number(),
                message: "hello world".to_string(),
                raw_line: "{}".to_string(),
                attributes: attrs,
                app: app.to_string(),
                service: Some("svc".to_string()),
                hostname: Some("host-a".to_string()),
                pid: None,
                event_id: None,
                source: Some("tcp".to_string()),
            },
        )
    }

    #[tokio::test]
    async fn insert_then_count_round_trips() {
        let store = Store::open(None, 4, Duration::from_secs(5)).unwrap();
        store
            .insert_batch(vec![
                sample(1, "payments", Severity::Info),
                sample(2, "payments", Severity::Warn),
                sample(3, "search", Severity::Error),
            ])
            .await
            .unwrap();

        assert_eq!(store.total_log_count(QueryOpts::default()).await.unwrap(), 3);
        assert_eq!(
            store.total_log_count(QueryOpts { app: "payments".to_string() }).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn list_apps_and_severity_counts() {
        let store = Store::open(None, 4, Duration::from_secs(5)).unwrap();
        store
            .insert_batch(vec![
                sample(1, "payments", Severity::Info),
                sample(2, "search", Severity::Error),
            ])
            .await
            .unwrap();

        let mut apps = store.list_apps().await.unwrap();
        apps.sort();
        assert_eq!(apps, vec!["payments".to_string(), "search".to_string()]);

        let counts = store.severity_counts(QueryOpts::default()).await.unwrap();
        assert!(counts.contains(&("INFO".to_string(), 1)));
    }

    #[tokio::test]
    async fn delete_older_than_removes_rows() {
        let store = Store::open(None, 4, Duration::from_secs(5)).unwrap();
        store.insert_batch(vec![sample(1, "payments", Severity::Info)]).await.unwrap();
        let deleted = store.delete_older_than(Duration::from_secs(0)).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.total_log_count(QueryOpts::default()).await.unwrap(), 0);
    }
}
