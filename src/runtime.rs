//! Server lifecycle (C11): wires every subsystem together and enforces the
//! startup/shutdown ordering from spec.md §4.11.
//!
//! Grounded in the teacher's `runtime/runtime.rs` shape: a ctrl-c listener
//! that triggers a shared [`Shutdown`], ambient background tasks raced
//! against shutdown receivers, a `Vec<JoinHandle<()>>` of subsystem tasks
//! awaited after the shutdown signal fires, then an ordered teardown of the
//! durability-critical components.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use sysinfo::System;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::backup::{self, uploader::S3CliUploader, BackupConfig};
use crate::buffer::{BufferConfig, InsertBuffer};
use crate::config::Config;
use crate::http;
use crate::ipc::IpcServer;
use crate::journal::Journal;
use crate::metrics;
use crate::model::IngestEnvelope;
use crate::retention;
use crate::shutdown::{Shutdown, SHUTDOWN_DEADLINE};
use crate::source::mux::{Multiplexer, DEFAULT_BUFFER_CAPACITY};
use crate::source::{StdinSource, StreamListenerSource, LogSource, DEFAULT_MAX_LINE_BYTES};
use crate::store::Store;

/// Loads configuration, opens every subsystem in the order spec.md §4.11
/// requires, and blocks until a shutdown signal is observed and every
/// subsystem has drained.
#[instrument(name = "runtime::run", skip_all, level = "info")]
pub async fn run(config_path: PathBuf) -> Result<()> {
    let cold_start = Instant::now();

    let shutdown = Shutdown::new();

    tracing::info!(config = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)?;

    let shutdown_signal = shutdown.clone();
    let socket_path = config.socket_path.clone();
    tokio::spawn(async move {
        loop {
            if signal::ctrl_c().await.is_err() {
                tracing::error!("failed to listen for shutdown signal");
                return;
            }
            if shutdown_signal.trigger() {
                tracing::warn!("second shutdown signal received, forcing immediate exit");
                let _ = std::fs::remove_file(&socket_path);
                std::process::exit(1);
            }
        }
    });

    spawn_ambient_tasks(&config, &shutdown);

    // Startup order per spec.md §4.11.
    tracing::debug!("opening store");
    let store = Store::open(config.db_path.as_deref(), config.max_concurrent_queries, config.query_timeout)?;

    tracing::debug!(path = %config.journal_path.display(), "opening journal");
    let journal = Arc::new(Journal::open(&config.journal_path, config.journal_enabled)?);
    replay_journal(&journal, &store, config.insert_batch_size).await?;

    let buffer_config = BufferConfig {
        batch_size: config.insert_batch_size,
        flush_interval: config.insert_flush_interval,
        flush_queue_size: config.insert_flush_queue_size,
    };
    let insert_buffer = InsertBuffer::new(buffer_config, journal.clone(), store.clone(), shutdown.clone());

    let mut task_handles: Vec<JoinHandle<()>> = Vec::new();

    task_handles.push(tokio::spawn(retention::run(store.clone(), config.log_retention_days, shutdown.clone())));

    if config.backup_enabled {
        let uploader = build_uploader(&config);
        let backup_config = BackupConfig {
            interval: config.backup_interval,
            local_dir: config.backup_local_dir.clone(),
            keep_last: config.backup_keep_last,
        };
        task_handles.push(tokio::spawn(backup::run(store.clone(), backup_config, uploader, shutdown.clone())));
    } else {
        tracing::info!("backup manager disabled (backup.enabled = false)");
    }

    if config.api_enabled {
        let addr = config.api_addr.parse()?;
        task_handles.push(tokio::spawn(http::serve(addr, store.clone(), shutdown.clone())));
    } else {
        tracing::info!("HTTP query surface disabled (http.api-enabled = false)");
    }

    let ipc_server = IpcServer::start(config.socket_path.clone(), store.clone(), shutdown.clone()).await?;

    let sources = build_sources(&config).await;
    let mux = Arc::new(Multiplexer::new(sources, config.mux_buffer_size));
    mux.start().await;

    let ingestion = tokio::spawn(ingestion_worker(mux.clone(), insert_buffer, shutdown.clone()));

    let cold_start_duration = cold_start.elapsed().as_secs_f64();
    tracing::info!(startup_seconds = cold_start_duration, "lotus is up");

    shutdown.wait_for_shutdown().await;
    tracing::info!("shutdown signal observed, draining");

    let drain = drain_in_order(mux, ingestion, ipc_server, task_handles, journal, store);
    if tokio::time::timeout(SHUTDOWN_DEADLINE, drain).await.is_err() {
        tracing::warn!("shutdown deadline exceeded, exiting without a full drain");
        let _ = std::fs::remove_file(&config.socket_path);
        std::process::exit(1);
    }

    tracing::info!("lotus shut down cleanly");
    Ok(())
}

/// Shutdown order per spec.md §4.11: stop the multiplexer (which stops every
/// source and closes the ingest envelope channel), let the ingestion worker
/// exit and drain the insert buffer (the durability-critical step, performed
/// inside the worker itself since it alone owns the buffer), then stop the
/// ambient subsystems and close the journal and store.
async fn drain_in_order(
    mux: Arc<Multiplexer>,
    ingestion: JoinHandle<()>,
    ipc_server: IpcServer,
    task_handles: Vec<JoinHandle<()>>,
    journal: Arc<Journal>,
    store: Store,
) {
    mux.stop().await;
    if let Err(err) = ingestion.await {
        tracing::error!(error = %err, "ingestion worker task panicked");
    }

    for handle in task_handles {
        let _ = handle.await;
    }

    ipc_server.stop().await;

    match Arc::try_unwrap(journal) {
        Ok(journal) => journal.close(),
        Err(_) => tracing::warn!("journal still has outstanding references at shutdown"),
    }

    drop(store);
}

async fn replay_journal(journal: &Arc<Journal>, store: &Store, batch_size: usize) -> Result<()> {
    if !journal.is_enabled() {
        return Ok(());
    }
    tracing::info!("replaying uncommitted journal suffix");
    let mut batch: Vec<(u64, crate::model::CanonicalLogRecord)> = Vec::with_capacity(batch_size);
    let mut replayed = 0u64;
    let committed = journal.replay(|seq, record| {
        batch.push((seq, record));
    })?;
    let _ = committed;
    for chunk in batch.chunks(batch_size.max(1)) {
        let max_seq = chunk.iter().map(|(seq, _)| *seq).max().unwrap_or(0);
        store.insert_batch(chunk.to_vec()).await?;
        journal.commit(max_seq)?;
        replayed += chunk.len() as u64;
    }
    if replayed > 0 {
        tracing::info!(replayed, "journal replay complete");
    }
    Ok(())
}

fn build_uploader(config: &Config) -> Option<Arc<dyn backup::uploader::Uploader>> {
    let bucket_url = config.backup_bucket_url.clone()?;
    match S3CliUploader::new(bucket_url, config.backup_s3.clone()) {
        Ok(uploader) => Some(Arc::new(uploader)),
        Err(err) => {
            tracing::error!(error = %err, "failed to configure remote backup uploader, backups will stay local-only");
            None
        }
    }
}

async fn build_sources(config: &Config) -> Vec<Arc<dyn LogSource>> {
    let mut sources: Vec<Arc<dyn LogSource>> = Vec::new();

    if config.tcp_enabled {
        let addr = match config.tcp_addr.parse() {
            Ok(addr) => addr,
            Err(err) => {
                tracing::error!(error = %err, addr = %config.tcp_addr, "invalid tcp-addr, stream listener source not enabled");
                return sources;
            }
        };
        match StreamListenerSource::bind(addr, DEFAULT_MAX_LINE_BYTES, DEFAULT_BUFFER_CAPACITY).await {
            Ok(source) => {
                tracing::info!(%addr, "stream listener source enabled");
                sources.push(Arc::new(source));
            }
            Err(err) => {
                tracing::error!(error = %err, %addr, "failed to bind stream listener source, it will not be enabled");
            }
        }
    }

    if StdinSource::should_enable() {
        tracing::info!("stdin source enabled (standard input is not a terminal)");
        sources.push(Arc::new(StdinSource::start(DEFAULT_MAX_LINE_BYTES, DEFAULT_BUFFER_CAPACITY)));
    } else {
        tracing::debug!("stdin source not enabled (standard input is a terminal)");
    }

    sources
}

/// Drains the multiplexer's merged output, parses each envelope, and hands
/// every resulting canonical record to the insert buffer.
#[instrument(name = "runtime::ingestion_worker", skip_all, level = "info")]
async fn ingestion_worker(mux: Arc<Multiplexer>, insert_buffer: InsertBuffer, shutdown: Shutdown) {
    let Some(mut receiver) = mux.take_receiver().await else {
        tracing::error!("multiplexer output already taken, ingestion worker exiting immediately");
        insert_buffer.stop().await;
        return;
    };

    while let Some(envelope) = receiver.recv().await {
        for record in crate::parser::parse(&envelope) {
            metrics::RECORDS_INGESTED_TOTAL.inc();
            if let Err(err) = insert_buffer.process(record).await {
                tracing::error!(error = %err, "failed to accept canonical record into insert buffer");
                if shutdown.is_forced() {
                    break;
                }
            }
        }
    }

    tracing::debug!("ingestion worker exiting: multiplexer output closed");
    insert_buffer.stop().await;
}

/// Spawns the ambient per-process gauges the teacher always runs alongside
/// the main service: the metrics HTTP endpoint and a periodic CPU/memory
/// sampler.
fn spawn_ambient_tasks(config: &Config, shutdown: &Shutdown) {
    tokio::spawn({
        let addr = config.metrics_addr.clone();
        let shutdown = shutdown.clone();
        async move {
            match addr.parse() {
                Ok(addr) => metrics::serve(addr, shutdown).await,
                Err(err) => tracing::error!(error = %err, %addr, "invalid metrics-addr, metrics endpoint disabled"),
            }
        }
    });

    tokio::spawn({
        let mut shutdown_rx = shutdown.subscribe();
        async move {
            let mut sys = System::new_all();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {
                        sys.refresh_all();
                        tracing::trace!(
                            used_memory_kb = sys.used_memory(),
                            "node resource sample"
                        );
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("resource sampler shutting down");
                        return;
                    }
                }
            }
        }
    });
}
