use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that compacts the WAL once enough units of work have
/// piled up since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

/// One compactor pass. Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold.max(1) {
        return false;
    }
    match engine.compact_wal().await {
        Ok(units) => {
            info!("compacted WAL after {appends} appends into {units} units");
            true
        }
        Err(e) => {
            tracing::warn!("WAL compaction failed: {e}");
            false
        }
    }
}
