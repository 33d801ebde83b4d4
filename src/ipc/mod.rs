//! IPC query surface (C10): newline-delimited JSON-RPC 2.0 over a Unix
//! domain socket, per spec.md §4.10 and the method suite in §6.3.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::error::RpcError;
use crate::shutdown::Shutdown;
use crate::store::{QueryOpts, RecentLogsParams, Store};

/// Minimum per-line read buffer, per spec.md §4.10.
const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct RpcSuccess {
    jsonrpc: &'static str,
    id: Value,
    result: Value,
}

#[derive(Debug, Serialize)]
struct RpcFailure {
    jsonrpc: &'static str,
    id: Value,
    error: RpcErrorBody,
}

#[derive(Debug, Serialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Runs the IPC query surface until `shutdown` fires: unlinks a stale socket
/// file, binds, and serves one task per accepted connection.
pub struct IpcServer {
    socket_path: PathBuf,
    listener_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    connections: Arc<std::sync::Mutex<Vec<JoinHandle<()>>>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for IpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcServer").field("socket_path", &self.socket_path).finish()
    }
}

impl IpcServer {
    /// Unlinks any stale socket at `socket_path`, binds, and starts accepting.
    #[instrument(name = "ipc::start", skip(store, shutdown), fields(socket_path = %socket_path.display()), level = "info")]
    pub async fn start(socket_path: PathBuf, store: Store, shutdown: Shutdown) -> std::io::Result<Self> {
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        unlink_stale(&socket_path).await;

        let listener = UnixListener::bind(&socket_path)?;
        tracing::info!(socket_path = %socket_path.display(), "IPC query surface listening");

        let connections: Arc<std::sync::Mutex<Vec<JoinHandle<()>>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let accept_connections = connections.clone();
        let mut shutdown_rx = shutdown.subscribe();
        let accept_store = store.clone();
        let accept_shutdown = shutdown.clone();

        let listener_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, _addr) = match accepted {
                            Ok(pair) => pair,
                            Err(err) => {
                                tracing::warn!(error = %err, "IPC accept error");
                                continue;
                            }
                        };
                        let store = accept_store.clone();
                        let conn_shutdown = accept_shutdown.clone();
                        let handle = tokio::spawn(async move {
                            serve_connection(stream, store, conn_shutdown).await;
                        });
                        accept_connections.lock().unwrap_or_else(|e| e.into_inner()).push(handle);
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("IPC accept loop shutting down");
                        return;
                    }
                }
            }
        });

        Ok(Self {
            socket_path,
            listener_task: std::sync::Mutex::new(Some(listener_task)),
            connections,
            stopped: AtomicBool::new(false),
        })
    }

    /// Closes the listener, waits for every accepted connection to finish,
    /// and unlinks the socket file. Idempotent.
    #[instrument(name = "ipc::stop", skip_all, level = "info")]
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.listener_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
            let _ = handle.await;
        }
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.connections.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            let _ = handle.await;
        }
        unlink_stale(&self.socket_path).await;
    }
}

async fn unlink_stale(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "removed stale IPC socket file"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(path = %path.display(), error = %err, "failed to remove stale IPC socket file"),
    }
}

/// Serves one connection: requests are read and dispatched sequentially,
/// preserving the incoming `id` on every response; the connection closes
/// when the peer disconnects or `shutdown` fires.
#[instrument(name = "ipc::serve_connection", skip_all, level = "debug")]
async fn serve_connection(stream: UnixStream, store: Store, shutdown: Shutdown) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::with_capacity(MAX_LINE_BYTES, reader).lines();
    let mut shutdown_rx = shutdown.subscribe();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => return,
                    Err(err) => {
                        tracing::warn!(error = %err, "IPC connection read error");
                        return;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = dispatch_line(&line, &store).await;
                let mut payload = serde_json::to_vec(&response).unwrap_or_else(|_| b"{}".to_vec());
                payload.push(b'\n');
                if writer.write_all(&payload).await.is_err() {
                    return;
                }
            }
            _ = shutdown_rx.recv() => {
                return;
            }
        }
    }
}

async fn dispatch_line(line: &str, store: &Store) -> Value {
    let request: RpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(_) => return error_response(Value::Null, RpcError::Parse),
    };
    let id = request.id.clone();
    match dispatch(&request, store).await {
        Ok(result) => serde_json::to_value(RpcSuccess { jsonrpc: "2.0", id, result }).unwrap_or(Value::Null),
        Err(err) => error_response(id, err),
    }
}

fn error_response(id: Value, err: RpcError) -> Value {
    serde_json::to_value(RpcFailure { jsonrpc: "2.0", id, error: RpcErrorBody { code: err.code(), message: err.to_string() } })
        .unwrap_or(Value::Null)
}

fn param<T: serde::de::DeserializeOwned>(params: &Value, field: &str, default: T) -> Result<T, RpcError> {
    match params.get(field) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => serde_json::from_value(value.clone()).map_err(|err| RpcError::InvalidParams(format!("{field}: {err}"))),
    }
}

fn opts_param(params: &Value) -> Result<QueryOpts, RpcError> {
    let app: String = param(params, "App", String::new()).or_else(|_| param(params, "app", String::new()))?;
    Ok(QueryOpts { app })
}

#[instrument(name = "ipc::dispatch", skip_all, fields(method = %request.method), level = "debug")]
async fn dispatch(request: &RpcRequest, store: &Store) -> Result<Value, RpcError> {
    let params = &request.params;
    match request.method.as_str() {
        "TotalLogCount" => {
            let opts = opts_param(params)?;
            Ok(json!(store.total_log_count(opts).await.map_err(RpcError::from)?))
        }
        "TotalLogBytes" => {
            let opts = opts_param(params)?;
            Ok(json!(store.total_log_bytes(opts).await.map_err(RpcError::from)?))
        }
        "TopWords" => {
            let limit: usize = param(params, "Limit", 10)?;
            let opts = opts_param(params)?;
            let rows = store.top_words(limit, opts).await.map_err(RpcError::from)?;
            Ok(json!(rows.into_iter().map(|(word, count)| json!({"Word": word, "Count": count})).collect::<Vec<_>>()))
        }
        "TopAttributes" => {
            let limit: usize = param(params, "Limit", 10)?;
            let opts = opts_param(params)?;
            let rows = store.top_attributes(limit, opts).await.map_err(RpcError::from)?;
            Ok(json!(rows.into_iter().map(|(k, v, c)| json!({"Key": k, "Value": v, "Count": c})).collect::<Vec<_>>()))
        }
        "TopAttributeKeys" => {
            let limit: usize = param(params, "Limit", 10)?;
            let opts = opts_param(params)?;
            let rows = store.top_attribute_keys(limit, opts).await.map_err(RpcError::from)?;
            Ok(json!(
                rows.into_iter()
                    .map(|(k, unique, total)| json!({"Key": k, "UniqueValues": unique, "TotalCount": total}))
                    .collect::<Vec<_>>()
            ))
        }
        "AttributeKeyValues" => {
            let key: String = param(params, "Key", String::new())?;
            let limit: usize = param(params, "Limit", 10)?;
            let rows = store.attribute_key_values(key, limit).await.map_err(RpcError::from)?;
            Ok(json!(rows.into_iter().collect::<std::collections::BTreeMap<_, _>>()))
        }
        "SeverityCounts" => {
            let opts = opts_param(params)?;
            let rows = store.severity_counts(opts).await.map_err(RpcError::from)?;
            Ok(json!(rows.into_iter().collect::<std::collections::BTreeMap<_, _>>()))
        }
        "SeverityCountsByMinute" => {
            let window: i64 = param(params, "Window", 60)?;
            let opts = opts_param(params)?;
            let buckets = store.severity_counts_by_minute(window, opts).await.map_err(RpcError::from)?;
            Ok(json!(
                buckets
                    .into_iter()
                    .map(|bucket| {
                        let mut entry = serde_json::Map::new();
                        entry.insert("Minute".to_string(), json!(bucket.minute));
                        for (label, count) in bucket.counts {
                            entry.insert(label, json!(count));
                        }
                        entry.insert("Total".to_string(), json!(bucket.total));
                        Value::Object(entry)
                    })
                    .collect::<Vec<_>>()
            ))
        }
        "TopHosts" => {
            let limit: usize = param(params, "Limit", 10)?;
            let opts = opts_param(params)?;
            let rows = store.top_hosts(limit, opts).await.map_err(RpcError::from)?;
            Ok(json!(rows.into_iter().map(|(v, c)| json!({"Value": v, "Count": c})).collect::<Vec<_>>()))
        }
        "TopServices" => {
            let limit: usize = param(params, "Limit", 10)?;
            let opts = opts_param(params)?;
            let rows = store.top_services(limit, opts).await.map_err(RpcError::from)?;
            Ok(json!(rows.into_iter().map(|(v, c)| json!({"Value": v, "Count": c})).collect::<Vec<_>>()))
        }
        "TopServicesBySeverity" => {
            let severity: String = param(params, "Severity", String::new())?;
            let limit: usize = param(params, "Limit", 10)?;
            let opts = opts_param(params)?;
            let rows = store.top_services_by_severity(severity, limit, opts).await.map_err(RpcError::from)?;
            Ok(json!(rows.into_iter().map(|(v, c)| json!({"Value": v, "Count": c})).collect::<Vec<_>>()))
        }
        "ListApps" => Ok(json!(store.list_apps().await.map_err(RpcError::from)?)),
        "RecentLogsFiltered" => {
            let limit: usize = param(params, "Limit", 100)?;
            let app: String = param(params, "App", String::new())?;
            let severity_levels: Vec<String> = param(params, "SeverityLevels", Vec::new())?;
            let message_pattern: String = param(params, "MessagePattern", String::new())?;
            let records = store
                .recent_logs_filtered(RecentLogsParams { limit, app, severity_levels, message_pattern })
                .await
                .map_err(RpcError::from)?;
            Ok(json!(records))
        }
        other => Err(RpcError::MethodNotFound(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CanonicalLogRecord, Severity};
    use std::collections::BTreeMap;
    use std::time::Duration;

    async fn sample_store() -> Store {
        let store = Store::open(None, 4, Duration::from_secs(5)).unwrap();
        let record = CanonicalLogRecord {
            receive_timestamp: chrono::Utc::now(),
            origin_timestamp_nanos: 0,
            severity_label: Severity::Info,
            severity_number: 9,
            message: "hello world".to_string(),
            raw_line: "{}".to_string(),
            attributes: BTreeMap::new(),
            app: "payments".to_string(),
            service: None,
            hostname: None,
            pid: None,
            event_id: None,
            source: None,
        };
        store.insert_batch(vec![(1, record)]).await.unwrap();
        store
    }

    #[tokio::test]
    async fn dispatch_total_log_count() {
        let store = sample_store().await;
        let request = RpcRequest { jsonrpc: Some("2.0".to_string()), id: json!(1), method: "TotalLogCount".to_string(), params: json!({}) };
        let result = dispatch(&request, &store).await.unwrap();
        assert_eq!(result, json!(1));
    }

    #[tokio::test]
    async fn dispatch_unknown_method_errors() {
        let store = sample_store().await;
        let request = RpcRequest { jsonrpc: None, id: json!(1), method: "NoSuchMethod".to_string(), params: Value::Null };
        let err = dispatch(&request, &store).await.unwrap_err();
        assert_eq!(err.code(), -32601);
    }

    #[tokio::test]
    async fn dispatch_line_preserves_request_id() {
        let store = sample_store().await;
        let response = dispatch_line(r#"{"jsonrpc":"2.0","id":42,"method":"ListApps","params":{}}"#, &store).await;
        assert_eq!(response["id"], json!(42));
        assert_eq!(response["result"], json!(["payments"]));
    }

    #[tokio::test]
    async fn malformed_json_yields_parse_error() {
        let store = sample_store().await;
        let response = dispatch_line("not json", &store).await;
        assert_eq!(response["error"]["code"], json!(-32700));
    }
}
