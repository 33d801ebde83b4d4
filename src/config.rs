//! Configuration file loading and validation, per spec.md §6.5.
//!
//! TOML on disk, one section per subsystem, matching the teacher's
//! `helpers/load_config.rs` style. `Config::load` applies every default and
//! validation rule spec.md names before the server is allowed to start; a
//! validation failure here is a Startup fault (spec.md §7): fatal, non-zero
//! exit, diagnostic on stderr.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

fn default_true() -> bool {
    true
}

fn state_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        return PathBuf::from(xdg).join("lotus");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/state/lotus");
    }
    PathBuf::from("/tmp/lotus")
}

/// Default log directory, used to initialize logging before a configuration
/// file (which carries no log-dir option of its own, per spec.md §6.5) has
/// been loaded.
pub fn default_log_dir() -> PathBuf {
    state_dir().join("logs")
}

/// Default IPC socket path, per spec.md §4.10: prefer `$XDG_RUNTIME_DIR`, then
/// `~/.local/state/lotus`, then `/tmp`.
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join("lotus/lotus.sock");
    }
    if std::env::var("HOME").is_ok() {
        return state_dir().join("lotus.sock");
    }
    PathBuf::from("/tmp/lotus.sock")
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct RawConfig {
    #[serde(default)]
    general: RawGeneral,
    #[serde(default)]
    http: RawHttp,
    #[serde(default)]
    ipc: RawIpc,
    #[serde(default)]
    insert: RawInsert,
    #[serde(default)]
    journal: RawJournal,
    #[serde(default)]
    store: RawStore,
    #[serde(default)]
    retention: RawRetention,
    #[serde(default)]
    backup: RawBackup,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawGeneral {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default)]
    tcp_enabled: Option<bool>,
    #[serde(default)]
    tcp_port: Option<u16>,
    #[serde(default)]
    tcp_addr: Option<String>,
    #[serde(default)]
    mux_buffer_size: Option<usize>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for RawGeneral {
    fn default() -> Self {
        Self { host: default_host(), tcp_enabled: None, tcp_port: None, tcp_addr: None, mux_buffer_size: None }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct RawHttp {
    #[serde(default)]
    api_enabled: Option<bool>,
    #[serde(default)]
    api_port: Option<u16>,
    #[serde(default)]
    api_addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct RawIpc {
    #[serde(default)]
    socket_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct RawInsert {
    #[serde(default)]
    batch_size: Option<usize>,
    #[serde(default)]
    flush_interval_ms: Option<u64>,
    #[serde(default)]
    flush_queue_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct RawJournal {
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct RawStore {
    #[serde(default)]
    db_path: Option<PathBuf>,
    #[serde(default)]
    query_timeout_secs: Option<u64>,
    #[serde(default)]
    max_concurrent_queries: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct RawRetention {
    #[serde(default)]
    log_retention_days: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct RawBackup {
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    interval_secs: Option<u64>,
    #[serde(default)]
    local_dir: Option<PathBuf>,
    #[serde(default)]
    keep_last: Option<usize>,
    #[serde(default)]
    bucket_url: Option<String>,
    #[serde(default)]
    s3_endpoint: Option<String>,
    #[serde(default)]
    s3_region: Option<String>,
    #[serde(default)]
    s3_access_key: Option<String>,
    #[serde(default)]
    s3_secret_key: Option<String>,
    #[serde(default)]
    s3_session_token: Option<String>,
    #[serde(default)]
    s3_use_ssl: Option<bool>,
}

/// Fully resolved, validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub tcp_enabled: bool,
    pub tcp_addr: String,
    pub api_enabled: bool,
    pub api_addr: String,
    pub socket_path: PathBuf,
    pub db_path: Option<PathBuf>,
    pub query_timeout: Duration,
    pub max_concurrent_queries: usize,
    pub insert_batch_size: usize,
    pub insert_flush_interval: Duration,
    pub insert_flush_queue_size: usize,
    pub mux_buffer_size: usize,
    pub journal_enabled: bool,
    pub journal_path: PathBuf,
    pub log_retention_days: u32,
    pub backup_enabled: bool,
    pub backup_interval: Duration,
    pub backup_local_dir: PathBuf,
    pub backup_keep_last: usize,
    pub backup_bucket_url: Option<String>,
    pub backup_s3: S3Config,
    pub metrics_addr: String,
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub session_token: Option<String>,
    pub use_ssl: bool,
}

impl Config {
    /// Loads, defaults, and validates the configuration file at `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw_str = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file at {}", path.display()))?;
        let raw: RawConfig = toml::from_str(&raw_str)
            .with_context(|| format!("failed to parse configuration file at {}", path.display()))?;
        Self::from_raw(raw)
    }

    /// Loads defaults with no file on disk (used by tests and `validate` when
    /// a stub config is all that's needed).
    pub fn default_for_tests() -> Self {
        Self::from_raw(RawConfig::default()).expect("default config must validate")
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let host = raw.general.host;
        let tcp_port = raw.general.tcp_port.unwrap_or(4000);
        let tcp_addr = raw.general.tcp_addr.unwrap_or_else(|| format!("{host}:{tcp_port}"));
        let tcp_enabled = raw.general.tcp_enabled.unwrap_or(true);
        let mux_buffer_size = raw.general.mux_buffer_size.unwrap_or(50_000);

        let api_port = raw.http.api_port.unwrap_or(3000);
        let api_addr = raw.http.api_addr.unwrap_or_else(|| format!("{host}:{api_port}"));
        let api_enabled = raw.http.api_enabled.unwrap_or(true);

        if !(1..=65535).contains(&tcp_port) {
            bail!("tcp-port must be in 1..65535, got {tcp_port}");
        }
        if !(1..=65535).contains(&api_port) {
            bail!("api-port must be in 1..65535, got {api_port}");
        }

        let socket_path = raw.ipc.socket_path.unwrap_or_else(default_socket_path);
        let db_path = raw.store.db_path;
        let query_timeout = Duration::from_secs(raw.store.query_timeout_secs.unwrap_or(30));
        let max_concurrent_queries = raw.store.max_concurrent_queries.unwrap_or(8);

        let insert_batch_size = raw.insert.batch_size.unwrap_or(2_000);
        let insert_flush_interval = Duration::from_millis(raw.insert.flush_interval_ms.unwrap_or(100));
        let insert_flush_queue_size = raw.insert.flush_queue_size.unwrap_or(64);

        let journal_enabled = raw.journal.enabled;
        let journal_path = raw.journal.path.unwrap_or_else(|| state_dir().join("journal.log"));

        let log_retention_days = raw.retention.log_retention_days.unwrap_or(30);

        let backup_enabled = raw.backup.enabled.unwrap_or(false);
        let backup_interval = Duration::from_secs(raw.backup.interval_secs.unwrap_or(6 * 3600));
        let backup_local_dir = raw.backup.local_dir.unwrap_or_else(|| state_dir().join("backups"));
        let backup_keep_last = raw.backup.keep_last.unwrap_or(24);
        let backup_bucket_url = raw.backup.bucket_url.filter(|s| !s.is_empty());

        if backup_enabled {
            if backup_interval.is_zero() {
                bail!("backup-interval must be > 0 when backup-enabled is true");
            }
            if db_path.as_ref().map(|p| p.as_os_str().is_empty()).unwrap_or(true) {
                bail!("db-path must be set when backup-enabled is true");
            }
            if backup_bucket_url.is_some()
                && (raw.backup.s3_access_key.is_none() || raw.backup.s3_secret_key.is_none())
            {
                bail!("backup-s3-access-key and backup-s3-secret-key are required when backup-bucket-url is set");
            }
        }

        Ok(Config {
            host,
            tcp_enabled,
            tcp_addr,
            api_enabled,
            api_addr,
            socket_path,
            db_path,
            query_timeout,
            max_concurrent_queries,
            insert_batch_size,
            insert_flush_interval,
            insert_flush_queue_size,
            mux_buffer_size,
            journal_enabled,
            journal_path,
            log_retention_days,
            backup_enabled,
            backup_interval,
            backup_local_dir,
            backup_keep_last,
            backup_bucket_url,
            backup_s3: S3Config {
                endpoint: raw.backup.s3_endpoint,
                region: raw.backup.s3_region,
                access_key: raw.backup.s3_access_key,
                secret_key: raw.backup.s3_secret_key,
                session_token: raw.backup.s3_session_token,
                use_ssl: raw.backup.s3_use_ssl.unwrap_or(true),
            },
            metrics_addr: "127.0.0.1:9090".to_string(),
            log_dir: default_log_dir(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default_for_tests();
        assert_eq!(cfg.tcp_addr, "127.0.0.1:4000");
        assert_eq!(cfg.api_addr, "127.0.0.1:3000");
        assert_eq!(cfg.max_concurrent_queries, 8);
        assert_eq!(cfg.insert_batch_size, 2_000);
        assert_eq!(cfg.insert_flush_interval, Duration::from_millis(100));
        assert_eq!(cfg.insert_flush_queue_size, 64);
        assert_eq!(cfg.mux_buffer_size, 50_000);
        assert!(cfg.journal_enabled);
        assert_eq!(cfg.log_retention_days, 30);
        assert!(!cfg.backup_enabled);
        assert_eq!(cfg.backup_keep_last, 24);
    }

    #[test]
    fn rejects_invalid_tcp_port() {
        let raw = "[general]\ntcp-port = 70000\n";
        let parsed: RawConfig = toml::from_str(raw).unwrap();
        assert!(Config::from_raw(parsed).is_err());
    }

    #[test]
    fn rejects_backup_without_db_path() {
        let raw = "[backup]\nenabled = true\n";
        let parsed: RawConfig = toml::from_str(raw).unwrap();
        assert!(Config::from_raw(parsed).is_err());
    }

    #[test]
    fn rejects_bucket_url_without_credentials() {
        let raw = "[store]\ndb-path = \"/tmp/lotus.db\"\n[backup]\nenabled = true\nbucket-url = \"s3://bucket/prefix\"\n";
        let parsed: RawConfig = toml::from_str(raw).unwrap();
        assert!(Config::from_raw(parsed).is_err());
    }
}
