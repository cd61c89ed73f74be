use std::net::SocketAddr;

// ── Request-driven counters ─────────────────────────────────────

/// Counter: reservations committed.
pub const RESERVATIONS_TOTAL: &str = "pitchlock_reservations_total";

/// Counter: reservation attempts rejected with a conflict (including
/// lock-wait timeouts).
pub const CONFLICTS_TOTAL: &str = "pitchlock_conflicts_total";

/// Counter: resubmissions absorbed by the duplicate guard.
pub const DEDUP_HITS_TOTAL: &str = "pitchlock_dedup_hits_total";

/// Counter: maintenance slot rows created.
pub const MAINTENANCE_SLOTS_TOTAL: &str = "pitchlock_maintenance_slots_total";

/// Counter: bookings released by the expiry sweeper.
pub const SWEEPER_RELEASED_TOTAL: &str = "pitchlock_sweeper_released_total";

// ── Cache ───────────────────────────────────────────────────────

pub const CACHE_HITS_TOTAL: &str = "pitchlock_cache_hits_total";
pub const CACHE_MISSES_TOTAL: &str = "pitchlock_cache_misses_total";

// ── WAL ─────────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "pitchlock_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "pitchlock_wal_flush_batch_size";

/// Install the Prometheus metrics exporter on the given port. No-op if
/// `port` is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
