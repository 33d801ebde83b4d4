//! Process metrics, exposed on a small manual-`hyper` `/metrics` endpoint
//! independent of the HTTP query surface (C9), matching `metrics/http.rs` and
//! `metrics/metrics.rs` in the teacher.

use std::convert::Infallible;
use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HyperServerBuilder;
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_gauge, register_histogram, register_int_counter, Counter, Encoder,
    Gauge, Histogram, IntCounter, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::instrument;

use crate::shutdown::Shutdown;

lazy_static! {
    pub static ref RECORDS_INGESTED_TOTAL: IntCounter = register_int_counter!(
        "lotus_records_ingested_total",
        "Total canonical log records accepted by the insert buffer"
    )
    .unwrap();
    pub static ref RECORDS_DROPPED_TOTAL: IntCounter = register_int_counter!(
        "lotus_records_dropped_total",
        "Total envelopes dropped at parse time (malformed or unrecognized shape)"
    )
    .unwrap();
    pub static ref JOURNAL_APPENDS_TOTAL: IntCounter = register_int_counter!(
        "lotus_journal_appends_total",
        "Total entries appended to the journal"
    )
    .unwrap();
    pub static ref JOURNAL_COMMITS_TOTAL: IntCounter = register_int_counter!(
        "lotus_journal_commits_total",
        "Total commit() calls that advanced committed_seq"
    )
    .unwrap();
    pub static ref FLUSH_DURATION_SECONDS: Histogram = register_histogram!(
        "lotus_flush_duration_seconds",
        "Duration of insert buffer batch flushes",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    )
    .unwrap();
    pub static ref FLUSH_BATCH_SIZE: Gauge = register_gauge!(
        "lotus_flush_batch_size",
        "Size of the most recently flushed batch"
    )
    .unwrap();
    pub static ref QUERY_DURATION_SECONDS: Histogram = register_histogram!(
        "lotus_query_duration_seconds",
        "Duration of store queries, from gate acquisition to result",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
    )
    .unwrap();
    pub static ref GATE_WAIT_SECONDS: Histogram = register_histogram!(
        "lotus_query_gate_wait_seconds",
        "Time spent waiting for the store's reader concurrency gate"
    )
    .unwrap();
    pub static ref BACKUP_RUNS_TOTAL: Counter = register_counter!(
        "lotus_backup_runs_total",
        "Total backup snapshot attempts"
    )
    .unwrap();
    pub static ref BACKUP_LAST_SUCCESS_UNIX: Gauge = register_gauge!(
        "lotus_backup_last_success_unix_seconds",
        "Unix timestamp of the last successful backup snapshot"
    )
    .unwrap();
    pub static ref RETENTION_DELETED_TOTAL: Counter = register_counter!(
        "lotus_retention_deleted_total",
        "Total records removed by the retention cleaner"
    )
    .unwrap();
}

#[instrument(name = "metrics::handler", skip_all, level = "debug")]
async fn metrics_handler(_req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let metrics_families = prometheus::gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metrics_families, &mut buffer) {
        tracing::error!(error = %err, "failed to encode prometheus metrics");
    }
    let content_type = encoder.format_type().to_string();

    Ok(Response::builder()
        .header(CONTENT_TYPE, content_type)
        .body(Full::new(Bytes::from(buffer)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))))
}

/// Runs the metrics server until `shutdown` fires. Bind failures are logged
/// and the server simply does not start; metrics are ambient, never load-bearing.
#[instrument(name = "metrics::serve", skip_all, level = "debug")]
pub async fn serve(addr: SocketAddr, shutdown: Shutdown) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, %addr, "failed to bind metrics server, metrics endpoint disabled");
            return;
        }
    };
    tracing::info!(%addr, "metrics endpoint listening");

    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!(error = %err, "metrics server accept error");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let service = service_fn(|req: Request<Incoming>| async move {
                    match (req.method(), req.uri().path()) {
                        (&Method::GET, "/metrics") => metrics_handler(req).await,
                        _ => {
                            let body = Full::new(Bytes::from_static(b"not found"));
                            Ok(Response::builder().status(StatusCode::NOT_FOUND).body(body).unwrap())
                        }
                    }
                });
                tokio::spawn(async move {
                    if let Err(err) = HyperServerBuilder::new(TokioExecutor::new()).serve_connection(io, service).await {
                        tracing::debug!(error = %err, "metrics connection closed with error");
                    }
                });
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("metrics server shutting down");
                break;
            }
        }
    }
}
