//! ======================================================================
//!                                 GOALS
//! ======================================================================
//!
//! 1. No ongoing work is abruptly interrupted on the first termination signal
//! 2. All pending log data is flushed or persisted before the process exits
//! 3. All resources are released safely
//! 4. Shutdown is co-ordinated across every long-lived subsystem
//!
//! ======================================================================
//!                             BUILDING BLOCKS
//! ======================================================================
//!
//! 1. Shutdown signal broadcaster
//! - A central shared object (`Shutdown`) that notifies every subscribed task
//! at once that it's time to stop.
//!
//! 2. Graceful/forced state machine
//! - `RUNNING -> DRAINING (bounded deadline) -> TERMINATED`. A second
//! termination signal received while `DRAINING` forces `TERMINATED`
//! immediately, skipping the remaining drain.
//!
//! 3. Co-operative shutdown handling in each subsystem
//! - Long-running loops select on a shutdown receiver rather than running
//! unconditionally; they exit as soon as they observe the signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

/// Default grace period bounding the `DRAINING` state (spec.md §4.11).
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Tri-state lifecycle of the server, per the state machine in spec.md §9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Terminated,
}

/// Global shutdown manager, built on top of a broadcast channel.
///
/// - `tx` is cloned by every subsystem.
/// - Each subsystem calls `.subscribe()` to get its own receiver.
/// - Calling `.trigger()` moves the state to `DRAINING` and notifies every
/// subscriber; a second call while already `DRAINING` forces `TERMINATED`.
#[derive(Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
    forced: Arc<AtomicBool>,
    triggered: Arc<AtomicBool>,
}

impl Shutdown {
    /// Creates a new shutdown broadcast channel. A small buffer is sufficient
    /// since subscribers only ever observe a single logical event.
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(16);
        Self {
            tx,
            forced: Arc::new(AtomicBool::new(false)),
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns a new receiver handle for a subsystem.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Records one termination signal. The first call moves `RUNNING ->
    /// DRAINING` and broadcasts to every subscriber. A second call forces
    /// `DRAINING -> TERMINATED` and returns `true` to tell the caller to exit
    /// immediately without waiting out the drain deadline.
    pub fn trigger(&self) -> bool {
        let already_triggered = self.triggered.swap(true, Ordering::SeqCst);
        let _ = self.tx.send(());
        if already_triggered {
            self.forced.store(true, Ordering::SeqCst);
            tracing::warn!("Second termination signal received, forcing immediate shutdown");
            true
        } else {
            tracing::info!("Termination signal received, entering graceful drain");
            false
        }
    }

    pub fn is_forced(&self) -> bool {
        self.forced.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ShutdownState {
        if self.forced.load(Ordering::SeqCst) {
            ShutdownState::Terminated
        } else if self.triggered.load(Ordering::SeqCst) {
            ShutdownState::Draining
        } else {
            ShutdownState::Running
        }
    }

    /// Suspends the caller until the first termination signal is observed.
    pub async fn wait_for_shutdown(&self) {
        if self.triggered.load(Ordering::SeqCst) {
            return;
        }
        let mut rx = self.subscribe();
        let _ = rx.recv().await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown").field("state", &self.state()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_trigger_does_not_force() {
        let shutdown = Shutdown::new();
        assert_eq!(shutdown.state(), ShutdownState::Running);
        let forced = shutdown.trigger();
        assert!(!forced);
        assert_eq!(shutdown.state(), ShutdownState::Draining);
    }

    #[test]
    fn second_trigger_forces_termination() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.trigger());
        assert!(shutdown.trigger());
        assert_eq!(shutdown.state(), ShutdownState::Terminated);
        assert!(shutdown.is_forced());
    }

    #[tokio::test]
    async fn wait_for_shutdown_returns_after_trigger() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_for_shutdown().await;
        });
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("wait_for_shutdown should return promptly")
            .expect("task should not panic");
    }

    #[tokio::test]
    async fn idempotent_stop_never_panics() {
        // Exercises testable property 7: calling stop() twice never panics.
        let shutdown = Shutdown::new();
        shutdown.trigger();
        shutdown.trigger();
        shutdown.trigger();
    }
}
