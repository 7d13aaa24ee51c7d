use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// Background task that persists `completed` on bookings whose end time
/// has passed, so stored status converges with effective status.
pub async fn run_sweeper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        match engine.sweep_completed().await {
            Ok(0) => {}
            Ok(n) => {
                metrics::counter!(crate::observability::BOOKINGS_SWEPT_TOTAL).increment(n as u64);
                info!("swept {n} elapsed bookings to completed");
            }
            Err(e) => tracing::warn!("sweep failed: {e}"),
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => tracing::warn!("WAL compaction failed: {e}"),
        }
    }
}
