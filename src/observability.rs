use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: bookings committed by create, update or reactivation.
pub const BOOKINGS_COMMITTED_TOTAL: &str = "timetable_bookings_committed_total";

/// Counter: requests rejected for overlapping an existing booking. Labels: scope.
pub const CONFLICTS_TOTAL: &str = "timetable_conflicts_total";

/// Counter: postponements issued.
pub const POSTPONEMENTS_ISSUED_TOTAL: &str = "timetable_postponements_issued_total";

/// Counter: notices that could not be delivered.
pub const NOTICE_FAILURES_TOTAL: &str = "timetable_notice_failures_total";

// ── Reconciliation ──────────────────────────────────────────────

/// Counter: postponements reverted by the sweep.
pub const RECONCILE_REVERTED_TOTAL: &str = "timetable_reconcile_reverted_total";

/// Counter: dangling halves repaired by the sweep.
pub const RECONCILE_REPAIRED_TOTAL: &str = "timetable_reconcile_repaired_total";

/// Counter: per-record reconciliation failures.
pub const RECONCILE_FAILURES_TOTAL: &str = "timetable_reconcile_failures_total";

/// Histogram: duration of a full sweep in seconds.
pub const RECONCILE_DURATION_SECONDS: &str = "timetable_reconcile_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: time spent waiting for advisory locks in seconds.
pub const LOCK_WAIT_SECONDS: &str = "timetable_lock_wait_seconds";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "timetable_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "timetable_wal_flush_batch_size";

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
