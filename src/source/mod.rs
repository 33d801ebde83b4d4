//! Log sources (C1): the stream listener and standard-input sources, per
//! spec.md §4.1.

pub mod mux;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::model::IngestEnvelope;

/// Default maximum accepted line length, per spec.md §4.1.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// A log source: a bounded sequence of envelopes plus a name tag and a
/// cooperative stop. Implementations must tolerate `stop()` being called
/// more than once.
#[async_trait::async_trait]
pub trait LogSource: Send + Sync {
    /// Source tag attached to every envelope this source emits.
    fn name(&self) -> &str;

    /// Takes ownership of the receiving half of this source's output
    /// sequence. Returns `None` if already taken.
    fn take_receiver(&self) -> Option<mpsc::Receiver<IngestEnvelope>>;

    /// Releases resources and closes the output sequence. Idempotent.
    async fn stop(&self);
}

/// Scans `reader` for newline-delimited lines, dropping empty ones and
/// forwarding the rest as envelopes tagged `source_name`. A line longer than
/// `max_line_bytes` is reported via the returned `Err` and scanning stops;
/// callers decide whether that terminates just this connection or the whole
/// source, per spec.md §4.1.
#[instrument(name = "source::scan_lines", skip_all, fields(source = %source_name), level = "debug")]
async fn scan_lines<R>(
    reader: R,
    source_name: Arc<str>,
    tx: mpsc::Sender<IngestEnvelope>,
    max_line_bytes: usize,
    mut stopped: impl FnMut() -> bool,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        if stopped() {
            return;
        }
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.is_empty() {
                    continue;
                }
                if line.len() > max_line_bytes {
                    tracing::warn!(len = line.len(), max = max_line_bytes, "line exceeds maximum size, terminating connection");
                    return;
                }
                let envelope = IngestEnvelope::new(source_name.to_string(), line.into_bytes());
                if tx.send(envelope).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(error = %err, "error reading line, terminating connection");
                return;
            }
        }
    }
}

/// TCP stream listener source: one connection handler per accepted socket,
/// each independently scanned for newline-delimited lines.
pub struct StreamListenerSource {
    name: String,
    receiver: std::sync::Mutex<Option<mpsc::Receiver<IngestEnvelope>>>,
    stopped: Arc<AtomicBool>,
    accept_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    connections: Arc<std::sync::Mutex<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for StreamListenerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamListenerSource").field("name", &self.name).finish()
    }
}

impl StreamListenerSource {
    /// Binds `addr` and spawns the accept loop. Fails if the bind itself
    /// fails; per spec.md §4.1's enable discipline, callers should treat a
    /// failed construction as "this source did not enable" rather than a
    /// fatal startup error.
    #[instrument(name = "source::stream_listener::bind", skip(buffer_size), level = "info")]
    pub async fn bind(addr: std::net::SocketAddr, max_line_bytes: usize, buffer_size: usize) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let name = format!("tcp:{addr}");
        let (tx, rx) = mpsc::channel(buffer_size);
        let stopped = Arc::new(AtomicBool::new(false));
        let connections: Arc<std::sync::Mutex<Vec<JoinHandle<()>>>> = Arc::new(std::sync::Mutex::new(Vec::new()));

        let accept_name: Arc<str> = Arc::from(name.as_str());
        let accept_stopped = stopped.clone();
        let accept_connections = connections.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                if accept_stopped.load(Ordering::SeqCst) {
                    return;
                }
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        tracing::debug!(%peer, "accepted connection");
                        let tx = tx.clone();
                        let name = accept_name.clone();
                        let conn_stopped = accept_stopped.clone();
                        let handle = tokio::spawn(async move {
                            let (reader, _writer) = socket.into_split();
                            scan_lines(reader, name, tx, max_line_bytes, move || conn_stopped.load(Ordering::SeqCst)).await;
                        });
                        accept_connections.lock().unwrap_or_else(|e| e.into_inner()).push(handle);
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                        if accept_stopped.load(Ordering::SeqCst) {
                            return;
                        }
                    }
                }
            }
        });

        Ok(Self {
            name,
            receiver: std::sync::Mutex::new(Some(rx)),
            stopped,
            accept_task: std::sync::Mutex::new(Some(accept_task)),
            connections,
        })
    }
}

#[async_trait::async_trait]
impl LogSource for StreamListenerSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn take_receiver(&self) -> Option<mpsc::Receiver<IngestEnvelope>> {
        self.receiver.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    #[instrument(name = "source::stream_listener::stop", skip_all, fields(source = %self.name), level = "info")]
    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.accept_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
            let _ = handle.await;
        }
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.connections.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Standard-input source: scans stdin for newline-delimited lines. An
/// oversized line terminates the whole source, per spec.md §4.1.
pub struct StdinSource {
    name: &'static str,
    receiver: std::sync::Mutex<Option<mpsc::Receiver<IngestEnvelope>>>,
    stopped: Arc<AtomicBool>,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for StdinSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdinSource").finish()
    }
}

impl StdinSource {
    #[instrument(name = "source::stdin::start", level = "info")]
    pub fn start(max_line_bytes: usize, buffer_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer_size);
        let stopped = Arc::new(AtomicBool::new(false));
        let task_stopped = stopped.clone();
        let reader_task = tokio::spawn(async move {
            let stdin = tokio::io::stdin();
            scan_lines(stdin, Arc::from("stdin"), tx, max_line_bytes, move || task_stopped.load(Ordering::SeqCst)).await;
        });

        Self {
            name: "stdin",
            receiver: std::sync::Mutex::new(Some(rx)),
            stopped,
            reader_task: std::sync::Mutex::new(Some(reader_task)),
        }
    }

    /// True iff stdin is not connected to a terminal, per spec.md §4.1's
    /// enable discipline ("stdin is enabled iff standard input is not a
    /// terminal").
    pub fn should_enable() -> bool {
        use is_terminal::IsTerminal;
        !std::io::stdin().is_terminal()
    }
}

#[async_trait::async_trait]
impl LogSource for StdinSource {
    fn name(&self) -> &str {
        self.name
    }

    fn take_receiver(&self) -> Option<mpsc::Receiver<IngestEnvelope>> {
        self.receiver.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    #[instrument(name = "source::stdin::stop", skip_all, level = "info")]
    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.reader_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn scan_lines_drops_empty_and_forwards_nonempty() {
        let (tx, mut rx) = mpsc::channel(8);
        let data = b"first\n\nsecond\n".to_vec();
        let reader = std::io::Cursor::new(data);
        scan_lines(reader, Arc::from("test"), tx, DEFAULT_MAX_LINE_BYTES, || false).await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.line, b"first");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.line, b"second");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn scan_lines_stops_on_oversized_line() {
        let (tx, mut rx) = mpsc::channel(8);
        let data = b"ok\nthis-line-is-too-long\nok2\n".to_vec();
        let reader = std::io::Cursor::new(data);
        scan_lines(reader, Arc::from("test"), tx, 5, || false).await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.line, b"ok");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn stream_listener_round_trips_a_line() {
        let source = StreamListenerSource::bind("127.0.0.1:0".parse().unwrap(), DEFAULT_MAX_LINE_BYTES, 16).await.unwrap();
        let addr: std::net::SocketAddr = source.name().trim_start_matches("tcp:").parse().unwrap();
        let mut receiver = source.take_receiver().unwrap();

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"hello world\n").await.unwrap();

        let envelope = receiver.recv().await.unwrap();
        assert_eq!(envelope.line, b"hello world");

        source.stop().await;
    }
}
