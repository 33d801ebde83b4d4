//! HTTP query surface (C9): `GET /api/health`, `GET /api/schema`,
//! `POST /api/query`, per spec.md §4.9.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HyperServerBuilder;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::instrument;

use crate::error::StoreError;
use crate::shutdown::Shutdown;
use crate::store::Store;

const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

struct Server {
    store: Store,
    started_at: Instant,
}

#[derive(Deserialize)]
struct QueryRequest {
    sql: String,
}

/// Runs the HTTP query surface until `shutdown` fires. Bind failures are
/// logged and the surface simply does not start.
#[instrument(name = "http::serve", skip_all, level = "info")]
pub async fn serve(addr: SocketAddr, store: Store, shutdown: Shutdown) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, %addr, "failed to bind HTTP query surface");
            return;
        }
    };
    tracing::info!(%addr, "HTTP query surface listening");

    let server = Arc::new(Server { store, started_at: Instant::now() });
    let mut shutdown_rx = shutdown.subscribe();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!(error = %err, "HTTP accept error");
                        continue;
                    }
                };
                tracing::debug!(%peer, "accepted HTTP connection");
                let server = server.clone();
                let conn_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    serve_connection(stream, server, conn_shutdown).await;
                });
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("HTTP query surface shutting down");
                return;
            }
        }
    }
}

async fn serve_connection(stream: tokio::net::TcpStream, server: Arc<Server>, shutdown: Shutdown) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let server = server.clone();
        async move { handle(req, server).await }
    });

    let serve_future = HyperServerBuilder::new(TokioExecutor::new()).serve_connection(io, service);
    tokio::pin!(serve_future);

    tokio::select! {
        result = &mut serve_future => {
            if let Err(err) = result {
                tracing::debug!(error = %err, "HTTP connection closed with error");
            }
        }
        () = shutdown.wait_for_shutdown() => {
            tracing::debug!("draining HTTP connection on shutdown");
            let _ = tokio::time::timeout(WRITE_TIMEOUT, serve_future).await;
        }
    }
}

#[instrument(name = "http::handle", skip_all, fields(method = %req.method(), path = %req.uri().path()), level = "debug")]
async fn handle(req: Request<Incoming>, server: Arc<Server>) -> Result<Response<Full<Bytes>>, Infallible> {
    let deadline = Duration::from_secs(READ_HEADER_TIMEOUT.as_secs() + READ_TIMEOUT.as_secs());
    let response = tokio::time::timeout(deadline, route(req, server)).await.unwrap_or_else(|_| {
        json_response(StatusCode::REQUEST_TIMEOUT, json!({"error": "request timed out"}))
    });
    Ok(response)
}

async fn route(req: Request<Incoming>, server: Arc<Server>) -> Response<Full<Bytes>> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/api/health") => health(server).await,
        (&Method::GET, "/api/schema") => schema(server).await,
        (&Method::POST, "/api/query") => query(req, server).await,
        (_, "/api/health") | (_, "/api/schema") | (_, "/api/query") => {
            json_response(StatusCode::METHOD_NOT_ALLOWED, json!({"error": "method not allowed"}))
        }
        _ => json_response(StatusCode::NOT_FOUND, json!({"error": "not found"})),
    }
}

async fn health(server: Arc<Server>) -> Response<Full<Bytes>> {
    match server.store.total_log_count(Default::default()).await {
        Ok(log_count) => json_response(
            StatusCode::OK,
            json!({
                "status": "ok",
                "uptime": server.started_at.elapsed().as_secs_f64(),
                "log_count": log_count,
            }),
        ),
        Err(err) => store_error_response(err),
    }
}

async fn schema(server: Arc<Server>) -> Response<Full<Bytes>> {
    let description = match server.store.schema_description().await {
        Ok(description) => description,
        Err(err) => return store_error_response(err),
    };
    let row_counts = match server.store.table_row_counts().await {
        Ok(counts) => counts,
        Err(err) => return store_error_response(err),
    };
    json_response(
        StatusCode::OK,
        json!({
            "description": description,
            "tables": row_counts.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            "row_counts": row_counts.into_iter().collect::<std::collections::BTreeMap<_, _>>(),
        }),
    )
}

async fn query(req: Request<Incoming>, server: Arc<Server>) -> Response<Full<Bytes>> {
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => return json_response(StatusCode::BAD_REQUEST, json!({"error": format!("failed to read body: {err}")})),
    };
    if body.len() > MAX_BODY_BYTES {
        return json_response(StatusCode::BAD_REQUEST, json!({"error": "request body too large"}));
    }
    let parsed: QueryRequest = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(err) => return json_response(StatusCode::BAD_REQUEST, json!({"error": format!("invalid request body: {err}")})),
    };

    match server.store.execute_sql(&parsed.sql).await {
        Ok(result) => json_response(
            StatusCode::OK,
            json!({"columns": result.columns, "rows": result.rows, "row_count": result.row_count}),
        ),
        Err(StoreError::Rejected(reason)) => json_response(StatusCode::BAD_REQUEST, json!({"error": reason})),
        Err(err) => store_error_response(err),
    }
}

fn store_error_response(err: StoreError) -> Response<Full<Bytes>> {
    tracing::error!(error = %err, "store error handling HTTP request");
    json_response(StatusCode::INTERNAL_SERVER_ERROR, json!({"error": err.to_string()}))
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    let bytes = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(bytes)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CanonicalLogRecord, Severity};
    use std::collections::BTreeMap;

    async fn sample_server() -> Arc<Server> {
        let store = Store::open(None, 4, Duration::from_secs(5)).unwrap();
        let record = CanonicalLogRecord {
            receive_timestamp: chrono::Utc::now(),
            origin_timestamp_nanos: 0,
            severity_label: Severity::Info,
            severity_number: 9,
            message: "hello".to_string(),
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
        Arc::new(Server { store, started_at: Instant::now() })
    }

    #[tokio::test]
    async fn health_reports_log_count() {
        let server = sample_server().await;
        let response = health(server).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["log_count"], 1);
    }

    #[tokio::test]
    async fn query_rejects_forbidden_statement() {
        // `Incoming` bodies can't be constructed outside of a real hyper
        // connection, so this exercises the gate the handler delegates to.
        let server = sample_server().await;
        let result = server.store.execute_sql("SELECT 1; DROP TABLE logs").await;
        assert!(matches!(result, Err(StoreError::Rejected(_))));
    }

    #[tokio::test]
    async fn query_allows_select() {
        let server = sample_server().await;
        let result = server.store.execute_sql("SELECT COUNT(*) AS c FROM logs").await.unwrap();
        assert_eq!(result.row_count, 1);
    }
}
