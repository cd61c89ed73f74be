use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::limits::{COMPACT_CHECK_INTERVAL_SECS, GC_RETENTION_DAYS, SWEEP_INTERVAL_SECS};
use crate::model::{Day, Ms};
use crate::observability::SWEEPER_RELEASED_TOTAL;

fn wall_clock_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

fn today(now: Ms) -> Day {
    (now / 86_400_000) as Day
}

/// Background task that reclaims bookings stuck awaiting payment past the
/// timeout, releasing their slots. The first pass runs at startup.
pub async fn run_sweeper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
    loop {
        interval.tick().await;
        sweep_once(&engine).await;
    }
}

/// One sweep pass; returns how many bookings were released.
pub async fn sweep_once(engine: &Engine) -> usize {
    let now = wall_clock_ms();
    let mut released = 0;
    for booking_id in engine.collect_expired_bookings(now) {
        match expire_with_retry(engine, booking_id).await {
            Ok(()) => {
                info!("swept expired booking {booking_id}");
                metrics::counter!(SWEEPER_RELEASED_TOTAL).increment(1);
                released += 1;
            }
            Err(e) => {
                // Raced by a payment event or an explicit release — fine.
                debug!("sweeper skip {booking_id}: {e}");
            }
        }
    }
    released
}

/// A lock-wait timeout is transient: retry once, then leave the booking
/// for the next pass.
async fn expire_with_retry(engine: &Engine, booking_id: Ulid) -> Result<(), EngineError> {
    match engine.expire_booking(booking_id).await {
        Err(EngineError::Busy) => {
            warn!("sweeper retrying busy booking {booking_id}");
            engine.expire_booking(booking_id).await
        }
        other => other,
    }
}

/// Background task that garbage-collects long-past schedules and rewrites
/// the WAL once enough appends have accumulated since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(COMPACT_CHECK_INTERVAL_SECS));
    loop {
        interval.tick().await;
        if engine.wal_appends_since_compact().await < threshold {
            continue;
        }
        let dropped = engine.gc_past_days(today(wall_clock_ms()) - GC_RETENTION_DAYS);
        if dropped > 0 {
            info!("gc dropped {dropped} past schedules");
        }
        if let Err(e) = engine.compact_wal().await {
            warn!("compaction failed: {e}");
        }
    }
}
