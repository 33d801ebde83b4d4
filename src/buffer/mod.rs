//! Insert buffer (C4): batches canonical records, journals them durably
//! before acknowledging, and dispatches sealed batches to the store, per
//! spec.md §4.4.
//!
//! The flush-worker-pool-with-backoff shape is grounded in the teacher's
//! `shipper/shipper.rs` (`run_worker`/`connect_with_retry`); the durable
//! hand-off ahead of the batch store write is grounded in
//! `buffer_batcher/log_buffer_batcher.rs`'s WAL-then-batch idea, generalized
//! to the journal/store split spec.md requires.

use std::collections::BinaryHeap;
use std::cmp::Reverse;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::error::BufferError;
use crate::journal::Journal;
use crate::model::CanonicalLogRecord;
use crate::shutdown::Shutdown;
use crate::store::Store;

/// Tunables from spec.md §4.4, defaults matching §6.5.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub flush_queue_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self { batch_size: 2_000, flush_interval: Duration::from_millis(100), flush_queue_size: 64 }
    }
}

struct SealedBatch {
    index: u64,
    records: Vec<(u64, CanonicalLogRecord)>,
}

struct Inner {
    config: BufferConfig,
    journal: Arc<Journal>,
    store: Store,
    current: AsyncMutex<Vec<(u64, CanonicalLogRecord)>>,
    local_seq: AtomicU64,
    batch_index: AtomicU64,
    flush_tx: mpsc::Sender<SealedBatch>,
}

/// Handle to the running insert buffer; owns its background tasks.
pub struct InsertBuffer {
    inner: Arc<Inner>,
    flush_workers: Vec<JoinHandle<()>>,
    commit_sequencer: JoinHandle<()>,
    timer: JoinHandle<()>,
}

impl std::fmt::Debug for InsertBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsertBuffer").field("batch_size", &self.inner.config.batch_size).finish()
    }
}

const FLUSH_WORKER_COUNT: usize = 4;

impl InsertBuffer {
    /// Spawns the flush worker pool, the commit sequencer, and the flush
    /// interval timer, returning a handle bound to `shutdown`.
    #[instrument(name = "buffer::new", skip_all, level = "info")]
    pub fn new(config: BufferConfig, journal: Arc<Journal>, store: Store, shutdown: Shutdown) -> Self {
        let (flush_tx, flush_rx) = mpsc::channel(config.flush_queue_size.max(1));
        let (commit_tx, commit_rx) = mpsc::unbounded_channel::<(u64, u64)>();

        let inner = Arc::new(Inner {
            config: config.clone(),
            journal,
            store,
            current: AsyncMutex::new(Vec::with_capacity(config.batch_size)),
            local_seq: AtomicU64::new(1),
            batch_index: AtomicU64::new(0),
            flush_tx,
        });

        let shared_rx = Arc::new(AsyncMutex::new(flush_rx));
        let mut flush_workers = Vec::with_capacity(FLUSH_WORKER_COUNT);
        for worker_id in 0..FLUSH_WORKER_COUNT {
            let rx = shared_rx.clone();
            let store = inner.store.clone();
            let commit_tx = commit_tx.clone();
            let shutdown = shutdown.clone();
            flush_workers.push(tokio::spawn(flush_worker_loop(worker_id, rx, store, commit_tx, shutdown)));
        }
        drop(commit_tx);

        let commit_sequencer = tokio::spawn(commit_sequencer_loop(inner.clone(), commit_rx));
        let timer = tokio::spawn(flush_timer_loop(inner.clone(), shutdown));

        Self { inner, flush_workers, commit_sequencer, timer }
    }

    /// Accepts one record: journals it (if enabled), appends it to the
    /// current batch, and seals/dispatches the batch if it is now full.
    /// Returns only after the record is durable (or visibly in-flight to the
    /// store), per spec.md §4.4's acknowledgement contract.
    #[instrument(name = "buffer::process", skip_all, level = "trace")]
    pub async fn process(&self, record: CanonicalLogRecord) -> Result<(), BufferError> {
        let seq = if self.inner.journal.is_enabled() {
            self.inner.journal.append(&record)?
        } else {
            self.inner.local_seq.fetch_add(1, Ordering::SeqCst)
        };

        let sealed = {
            let mut batch = self.inner.current.lock().await;
            batch.push((seq, record));
            if batch.len() >= self.inner.config.batch_size {
                Some(std::mem::replace(&mut *batch, Vec::with_capacity(self.inner.config.batch_size)))
            } else {
                None
            }
        };

        if let Some(records) = sealed {
            self.inner.dispatch(records).await;
        }
        Ok(())
    }

    /// Stops accepting new records, seals and dispatches any partial batch,
    /// drains the flush queue, and waits for every background task to exit.
    #[instrument(name = "buffer::stop", skip_all, level = "info")]
    pub async fn stop(self) {
        let remaining = {
            let mut batch = self.inner.current.lock().await;
            std::mem::take(&mut *batch)
        };
        if !remaining.is_empty() {
            self.inner.dispatch(remaining).await;
        }

        let Self { inner, flush_workers, commit_sequencer, timer } = self;
        timer.abort();
        drop(inner);
        for worker in flush_workers {
            let _ = worker.await;
        }
        let _ = commit_sequencer.await;
        tracing::info!("insert buffer drained and stopped");
    }
}

impl Inner {
    async fn dispatch(&self, records: Vec<(u64, CanonicalLogRecord)>) {
        if records.is_empty() {
            return;
        }
        let index = self.batch_index.fetch_add(1, Ordering::SeqCst);
        if self.flush_tx.send(SealedBatch { index, records }).await.is_err() {
            tracing::error!("flush queue closed while dispatching a sealed batch");
        }
    }
}

#[instrument(name = "buffer::flush_worker", skip_all, level = "debug", fields(worker_id))]
async fn flush_worker_loop(
    worker_id: usize,
    rx: Arc<AsyncMutex<mpsc::Receiver<SealedBatch>>>,
    store: Store,
    commit_tx: mpsc::UnboundedSender<(u64, u64)>,
    shutdown: Shutdown,
) {
    loop {
        let batch = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(batch) = batch else {
            tracing::debug!(worker_id, "flush worker exiting: queue closed");
            return;
        };

        let max_seq = batch.records.iter().map(|(seq, _)| *seq).max().unwrap_or(0);
        let batch_len = batch.records.len();
        let started = std::time::Instant::now();

        insert_with_retry(&store, batch.records, &shutdown).await;

        crate::metrics::FLUSH_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());
        crate::metrics::FLUSH_BATCH_SIZE.set(batch_len as f64);

        if commit_tx.send((batch.index, max_seq)).is_err() {
            tracing::warn!(worker_id, "commit sequencer channel closed");
        }
    }
}

/// Retries `store.insert_batch` with exponential backoff until it succeeds or
/// shutdown is observed. A durability failure (spec.md §7) must never be
/// silently dropped: this loop only returns once the batch is in the store.
async fn insert_with_retry(store: &Store, records: Vec<(u64, CanonicalLogRecord)>, shutdown: &Shutdown) {
    use rand::Rng;

    let mut delay = Duration::from_millis(100);
    const MAX_DELAY: Duration = Duration::from_secs(30);
    const JITTER: f64 = 0.2;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match store.insert_batch(records.clone()).await {
            Ok(()) => return,
            Err(err) => {
                tracing::error!(error = %err, attempt, "batch insert failed, retrying");
                if shutdown.is_forced() {
                    tracing::error!("forced shutdown during flush retry, abandoning batch");
                    return;
                }
                // Jitter prevents every stalled flush worker from retrying
                // against the store in lockstep.
                let jitter_factor = rand::rng().random_range(1.0 - JITTER..1.0 + JITTER);
                tokio::time::sleep(delay.mul_f64(jitter_factor)).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
        }
    }
}

/// Reorders out-of-order batch completions so `commit(seq)` is always issued
/// in the order batches were sealed, preserving `committed_seq` monotonicity
/// (spec.md §4.4 "Ordering").
#[instrument(name = "buffer::commit_sequencer", skip_all, level = "debug")]
async fn commit_sequencer_loop(inner: Arc<Inner>, mut commit_rx: mpsc::UnboundedReceiver<(u64, u64)>) {
    let mut pending: BinaryHeap<Reverse<(u64, u64)>> = BinaryHeap::new();
    let mut next_index = 0u64;

    while let Some((index, max_seq)) = commit_rx.recv().await {
        pending.push(Reverse((index, max_seq)));
        while let Some(&Reverse((index, max_seq))) = pending.peek() {
            if index != next_index {
                break;
            }
            pending.pop();
            if let Err(err) = inner.journal.commit(max_seq) {
                tracing::error!(error = %err, max_seq, "journal commit failed");
            }
            next_index += 1;
        }
    }
}

#[instrument(name = "buffer::flush_timer", skip_all, level = "debug")]
async fn flush_timer_loop(inner: Arc<Inner>, shutdown: Shutdown) {
    let mut interval = tokio::time::interval(inner.config.flush_interval);
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let sealed = {
                    let mut batch = inner.current.lock().await;
                    if batch.is_empty() {
                        None
                    } else {
                        Some(std::mem::replace(&mut *batch, Vec::with_capacity(inner.config.batch_size)))
                    }
                };
                if let Some(records) = sealed {
                    inner.dispatch(records).await;
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("flush timer exiting on shutdown");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Severity;
    use std::collections::BTreeMap;

    fn sample(message: &str) -> CanonicalLogRecord {
        CanonicalLogRecord {
            receive_timestamp: chrono::Utc::now(),
            origin_timestamp_nanos: 0,
            severity_label: Severity::Info,
            severity_number: 9,
            message: message.to_string(),
            raw_line: "{}".to_string(),
            attributes: BTreeMap::new(),
            app: "default".to_string(),
            service: None,
            hostname: None,
            pid: None,
            event_id: None,
            source: Some("tcp".to_string()),
        }
    }

    #[tokio::test]
    async fn records_below_batch_size_are_visible_after_timer_flush() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(Journal::open(&dir.path().join("journal.log"), true).unwrap());
        let store = Store::open(None, 4, Duration::from_secs(5)).unwrap();
        let shutdown = Shutdown::new();
        let config = BufferConfig { batch_size: 100, flush_interval: Duration::from_millis(20), flush_queue_size: 8 };
        let buffer = InsertBuffer::new(config, journal, store.clone(), shutdown.clone());

        buffer.process(sample("a")).await.unwrap();
        buffer.process(sample("b")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let count = store.total_log_count(crate::store::QueryOpts::default()).await.unwrap();
        assert_eq!(count, 2);

        buffer.stop().await;
    }

    #[tokio::test]
    async fn batch_size_trigger_flushes_without_waiting_for_timer() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(Journal::open(&dir.path().join("journal.log"), true).unwrap());
        let store = Store::open(None, 4, Duration::from_secs(5)).unwrap();
        let shutdown = Shutdown::new();
        let config = BufferConfig { batch_size: 3, flush_interval: Duration::from_secs(60), flush_queue_size: 8 };
        let buffer = InsertBuffer::new(config, journal, store.clone(), shutdown.clone());

        for i in 0..3 {
            buffer.process(sample(&format!("rec-{i}"))).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.total_log_count(crate::store::QueryOpts::default()).await.unwrap(), 3);

        buffer.stop().await;
    }

    #[tokio::test]
    async fn stop_drains_partial_batch() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(Journal::open(&dir.path().join("journal.log"), true).unwrap());
        let store = Store::open(None, 4, Duration::from_secs(5)).unwrap();
        let shutdown = Shutdown::new();
        let config = BufferConfig { batch_size: 100, flush_interval: Duration::from_secs(60), flush_queue_size: 8 };
        let buffer = InsertBuffer::new(config, journal, store.clone(), shutdown.clone());

        buffer.process(sample("leftover")).await.unwrap();
        buffer.stop().await;

        assert_eq!(store.total_log_count(crate::store::QueryOpts::default()).await.unwrap(), 1);
    }
}
