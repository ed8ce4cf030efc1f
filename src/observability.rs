use std::net::SocketAddr;

// ── Booking metrics ─────────────────────────────────────────────

/// Counter: reservations committed.
pub const RESERVATIONS_CREATED_TOTAL: &str = "innkeep_reservations_created_total";

/// Counter: reservation updates committed. Labels: mode (preserve, replace).
pub const RESERVATIONS_UPDATED_TOTAL: &str = "innkeep_reservations_updated_total";

/// Counter: reservations cancelled.
pub const RESERVATIONS_CANCELLED_TOTAL: &str = "innkeep_reservations_cancelled_total";

/// Counter: create/update attempts rejected because a room was taken.
pub const ROOM_CONFLICTS_TOTAL: &str = "innkeep_room_conflicts_total";

/// Counter: create/update attempts rejected by input validation.
pub const VALIDATION_FAILURES_TOTAL: &str = "innkeep_validation_failures_total";

/// Counter: availability checks. Labels: result (free, taken, error).
pub const AVAILABILITY_CHECKS_TOTAL: &str = "innkeep_availability_checks_total";

/// Counter: cleaning lookups that fell back to the unknown status.
pub const CLEANING_LOOKUP_FAILURES_TOTAL: &str = "innkeep_cleaning_lookup_failures_total";

/// Histogram: calendar month rebuild duration in seconds.
pub const CALENDAR_REBUILD_DURATION_SECONDS: &str = "innkeep_calendar_rebuild_duration_seconds";

// ── Storage metrics ─────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "innkeep_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (units of work per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "innkeep_wal_flush_batch_size";

/// Counter: writes that gave up waiting for a room lock.
pub const LOCK_TIMEOUTS_TOTAL: &str = "innkeep_lock_timeouts_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
