//! Source multiplexer (C2): merges every configured log source into one
//! bounded output sequence, per spec.md §4.2.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::instrument;

use super::LogSource;
use crate::model::IngestEnvelope;

/// Default output buffer capacity, per spec.md §4.2.
pub const DEFAULT_BUFFER_CAPACITY: usize = 50_000;

/// Merges N log sources into one bounded output sequence. `start()`/`stop()`
/// are idempotent; ordering between sources is unspecified, FIFO within a
/// single source is preserved.
pub struct Multiplexer {
    sources: Vec<Arc<dyn LogSource>>,
    buffer_capacity: usize,
    out_rx: AsyncMutex<Option<mpsc::Receiver<IngestEnvelope>>>,
    started: AtomicBool,
    stopped: AtomicBool,
    forwarders: std::sync::Mutex<Vec<JoinHandle<()>>>,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("sources", &self.sources.iter().map(|s| s.name().to_string()).collect::<Vec<_>>())
            .field("buffer_capacity", &self.buffer_capacity)
            .finish()
    }
}

impl Multiplexer {
    pub fn new(sources: Vec<Arc<dyn LogSource>>, buffer_capacity: usize) -> Self {
        Self {
            sources,
            buffer_capacity,
            out_rx: AsyncMutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            forwarders: std::sync::Mutex::new(Vec::new()),
            supervisor: std::sync::Mutex::new(None),
        }
    }

    /// Spawns one forwarder per source and a supervisor that closes the
    /// output once every forwarder has exited. Idempotent.
    #[instrument(name = "mux::start", skip_all, fields(sources = self.sources.len()), level = "info")]
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let (out_tx, out_rx) = mpsc::channel(self.buffer_capacity);
        *self.out_rx.lock().await = Some(out_rx);

        let mut forwarders = Vec::with_capacity(self.sources.len());
        let mut done_rxs = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let Some(mut receiver) = source.take_receiver() else {
                tracing::warn!(source = source.name(), "source receiver already taken, skipping");
                continue;
            };
            let out_tx = out_tx.clone();
            let source_name = source.name().to_string();
            let (done_tx, done_rx) = tokio::sync::oneshot::channel();
            done_rxs.push(done_rx);
            let handle = tokio::spawn(async move {
                while let Some(envelope) = receiver.recv().await {
                    if envelope.line.is_empty() {
                        continue;
                    }
                    if out_tx.send(envelope).await.is_err() {
                        break;
                    }
                }
                tracing::debug!(source = %source_name, "forwarder exited");
                let _ = done_tx.send(());
            });
            forwarders.push(handle);
        }
        *self.forwarders.lock().unwrap_or_else(|e| e.into_inner()) = forwarders;

        let supervisor = tokio::spawn(async move {
            for done_rx in done_rxs {
                let _ = done_rx.await;
            }
            drop(out_tx);
            tracing::debug!("all forwarders exited, output sequence closed");
        });
        *self.supervisor.lock().unwrap_or_else(|e| e.into_inner()) = Some(supervisor);
    }

    /// Takes ownership of the merged output sequence. Returns `None` if
    /// already taken or if `start()` has not been called.
    pub async fn take_receiver(&self) -> Option<mpsc::Receiver<IngestEnvelope>> {
        self.out_rx.lock().await.take()
    }

    /// Cancels every source, waits for all forwarders, then returns once the
    /// output has closed. Idempotent.
    #[instrument(name = "mux::stop", skip_all, level = "info")]
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for source in &self.sources {
            source.stop().await;
        }
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.forwarders.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            let _ = handle.await;
        }
        if let Some(supervisor) = self.supervisor.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = supervisor.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::LogSource;

    struct FakeSource {
        name: String,
        receiver: std::sync::Mutex<Option<mpsc::Receiver<IngestEnvelope>>>,
    }

    #[async_trait::async_trait]
    impl LogSource for FakeSource {
        fn name(&self) -> &str {
            &self.name
        }
        fn take_receiver(&self) -> Option<mpsc::Receiver<IngestEnvelope>> {
            self.receiver.lock().unwrap().take()
        }
        async fn stop(&self) {}
    }

    fn fake_source(name: &str) -> (Arc<FakeSource>, mpsc::Sender<IngestEnvelope>) {
        let (tx, rx) = mpsc::channel(16);
        (Arc::new(FakeSource { name: name.to_string(), receiver: std::sync::Mutex::new(Some(rx)) }), tx)
    }

    #[tokio::test]
    async fn merges_two_sources_preserving_per_source_fifo() {
        let (source_a, tx_a) = fake_source("a");
        let (source_b, tx_b) = fake_source("b");
        let mux = Multiplexer::new(vec![source_a, source_b], 16);
        mux.start().await;
        let mut out = mux.take_receiver().await.unwrap();

        tx_a.send(IngestEnvelope::new("a", b"a1".to_vec())).await.unwrap();
        tx_a.send(IngestEnvelope::new("a", b"a2".to_vec())).await.unwrap();
        tx_b.send(IngestEnvelope::new("b", b"b1".to_vec())).await.unwrap();
        drop(tx_a);
        drop(tx_b);

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(out.recv().await.unwrap());
        }
        let a_lines: Vec<_> = seen.iter().filter(|e| e.source == "a").map(|e| e.line.clone()).collect();
        assert_eq!(a_lines, vec![b"a1".to_vec(), b"a2".to_vec()]);
        assert_eq!(seen.iter().filter(|e| e.source == "b").count(), 1);

        mux.stop().await;
        assert!(out.recv().await.is_none());
    }

    #[tokio::test]
    async fn stop_and_start_are_idempotent() {
        let (source, tx) = fake_source("a");
        drop(tx);
        let mux = Multiplexer::new(vec![source], 16);
        mux.start().await;
        mux.start().await;
        mux.stop().await;
        mux.stop().await;
    }
}
