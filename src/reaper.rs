use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::engine::Engine;
use crate::model::Ms;

/// How often unpaid holds are swept and how long a fresh one is spared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgePolicy {
    pub interval: Duration,
    pub grace_ms: Ms,
}

/// Remove unpaid bookings older than the grace period. Returns the count.
pub async fn purge_once(engine: &Engine, policy: PurgePolicy, now: Ms) -> usize {
    let cutoff = now.saturating_sub(policy.grace_ms);
    match engine.purge_unpaid_before(cutoff).await {
        Ok(n) => n,
        Err(e) => {
            error!("unpaid purge failed: {e}");
            0
        }
    }
}

/// Background task that periodically frees abandoned reservation holds.
pub async fn run_purger(engine: Arc<Engine>, policy: PurgePolicy) {
    let mut interval = tokio::time::interval(policy.interval);
    // The first tick fires immediately; skip it so startup replay is not
    // followed by an instant sweep.
    interval.tick().await;
    loop {
        interval.tick().await;
        let now = chrono::Utc::now().timestamp_millis();
        let removed = purge_once(&engine, policy, now).await;
        debug!(removed, "purge pass finished");
    }
}

/// Compact the tenant's WAL once `threshold` appends accumulated since the
/// last compaction. Returns whether a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!(appends, "compacted WAL");
            true
        }
        Err(e) => {
            error!("WAL compaction failed: {e}");
            false
        }
    }
}

pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}
