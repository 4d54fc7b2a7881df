use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::SweeperConfig;
use crate::engine::Engine;
use crate::observability::SWEEPER_EXPIRED_TOTAL;

/// One pass of the expiry sweep. Returns how many bookings were expired.
pub async fn sweep_once(engine: &Engine, config: &SweeperConfig) -> usize {
    let now = engine.now();
    let due = engine.collect_overdue(now, config.approval_ttl, config.payment_ttl);
    let mut expired = 0;
    for booking_id in due {
        match engine.expire(booking_id).await {
            Ok(_) => {
                expired += 1;
                metrics::counter!(SWEEPER_EXPIRED_TOTAL).increment(1);
            }
            // Approved, paid or cancelled since it was collected.
            Err(e) => debug!("sweeper skip {booking_id}: {e}"),
        }
    }
    expired
}

/// Background task expiring bookings stuck before approval or payment.
pub async fn run_sweeper(engine: Arc<Engine>, config: SweeperConfig) {
    let mut interval = tokio::time::interval(config.interval);
    loop {
        interval.tick().await;
        let expired = sweep_once(&engine, &config).await;
        if expired > 0 {
            info!("sweeper expired {expired} bookings");
        }
    }
}

/// Background task that compacts the WAL once enough records accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        if engine.wal_appends_since_compact().await < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(records) => info!("compacted WAL to {records} records"),
            Err(e) => error!("WAL compaction failed: {e}"),
        }
    }
}
