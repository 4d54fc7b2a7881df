use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "slotbook_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "slotbook_request_duration_seconds";

/// Counter: reservation attempts. Labels: outcome (`ok` or an error code).
pub const RESERVATIONS_TOTAL: &str = "slotbook_reservations_total";

/// Histogram: time spent inside the reservation transaction, in seconds.
pub const RESERVE_DURATION_SECONDS: &str = "slotbook_reserve_duration_seconds";

/// Counter: committed booking status changes. Labels: from, to.
pub const TRANSITIONS_TOTAL: &str = "slotbook_transitions_total";

/// Counter: writes rejected by the unique index after passing the lock-based check.
pub const UNIQUE_INDEX_REJECTIONS_TOTAL: &str = "slotbook_unique_index_rejections_total";

/// Counter: notifications published. Labels: kind.
pub const NOTIFICATIONS_PUBLISHED_TOTAL: &str = "slotbook_notifications_published_total";

/// Counter: bookings expired by the background sweeper.
pub const SWEEPER_EXPIRED_TOTAL: &str = "slotbook_sweeper_expired_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op when `port` is `None`.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
