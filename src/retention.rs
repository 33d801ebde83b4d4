//! Retention cleaner (C7): periodically deletes records older than the
//! configured horizon, per spec.md §4.7.

use std::time::Duration;

use tracing::instrument;

use crate::shutdown::Shutdown;
use crate::store::Store;

/// Default tick interval for the cleaner; the horizon itself is
/// `retention_days`, but the cleaner re-checks on a fixed daily cadence
/// regardless of how long the horizon is, per spec.md §4.7's "default daily".
const TICK_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Runs the retention cleaner loop until `shutdown` fires. A `retention_days`
/// of zero disables the cleaner entirely (spec.md §4.7).
#[instrument(name = "retention::run", skip_all, level = "info", fields(retention_days))]
pub async fn run(store: Store, retention_days: u32, shutdown: Shutdown) {
    if retention_days == 0 {
        tracing::info!("retention cleaner disabled (log-retention = 0)");
        return;
    }

    let horizon = Duration::from_secs(u64::from(retention_days) * 24 * 3600);
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    let mut shutdown_rx = shutdown.subscribe();

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match store.delete_older_than(horizon).await {
                    Ok(deleted) => {
                        if deleted > 0 {
                            crate::metrics::RETENTION_DELETED_TOTAL.inc_by(deleted as f64);
                        }
                        tracing::info!(deleted, retention_days, "retention sweep complete");
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "retention sweep failed, continuing on next tick");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("retention cleaner shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CanonicalLogRecord, Severity};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn disabled_when_retention_days_zero() {
        let store = Store::open(None, 4, Duration::from_secs(5)).unwrap();
        let shutdown = Shutdown::new();
        // Should return immediately without blocking the test.
        tokio::time::timeout(Duration::from_millis(200), run(store, 0, shutdown)).await.unwrap();
    }

    #[tokio::test]
    async fn deletes_records_older_than_horizon_directly() {
        let store = Store::open(None, 4, Duration::from_secs(5)).unwrap();
        let record = CanonicalLogRecord {
            receive_timestamp: chrono::Utc::now() - chrono::Duration::days(40),
            origin_timestamp_nanos: 0,
            severity_label: Severity::Info,
            severity_number: 9,
            message: "old".to_string(),
            raw_line: "{}".to_string(),
            attributes: BTreeMap::new(),
            app: "default".to_string(),
            service: None,
            hostname: None,
            pid: None,
            event_id: None,
            source: None,
        };
        store.insert_batch(vec![(1, record)]).await.unwrap();
        let deleted = store.delete_older_than(Duration::from_secs(30 * 24 * 3600)).await.unwrap();
        assert_eq!(deleted, 1);
    }
}
