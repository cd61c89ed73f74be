//! Hard limits and engine constants. Everything here is a deliberate cap —
//! requests beyond these bounds are rejected, not truncated.

/// Minutes in a calendar day; slot ranges live in `[0, MINUTES_PER_DAY)`.
pub const MINUTES_PER_DAY: i32 = 24 * 60;

/// Earliest accepted calendar day (days since Unix epoch): 2020-01-01.
pub const MIN_VALID_DAY: i32 = 18_262;

/// Latest accepted calendar day: ~2070.
pub const MAX_VALID_DAY: i32 = 36_500;

/// Ranges per reservation request.
pub const MAX_RANGES_PER_RESERVATION: usize = 16;

/// Occupied slot rows per (sub-field, day) schedule.
pub const MAX_SLOTS_PER_SCHEDULE: usize = 512;

/// Sub-fields registered under one field.
pub const MAX_SUB_FIELDS_PER_FIELD: usize = 64;

/// (sub-field, day) units touched by one maintenance call.
pub const MAX_MAINTENANCE_UNITS: usize = 256;

pub const MAX_NAME_LEN: usize = 128;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_CONTACT_FIELD_LEN: usize = 128;
pub const MAX_REASON_LEN: usize = 256;

/// A reservation left awaiting payment longer than this is swept.
pub const PAYMENT_TIMEOUT_MS: i64 = 10 * 60 * 1000;

/// Seconds between expiry sweeps (first sweep runs at startup).
pub const SWEEP_INTERVAL_SECS: u64 = 120;

/// Seconds between compaction-threshold checks.
pub const COMPACT_CHECK_INTERVAL_SECS: u64 = 60;

/// Schedules for days older than this many days are garbage-collected.
pub const GC_RETENTION_DAYS: i32 = 30;

/// Trailing window in which a resubmission of the same booking intent is
/// absorbed instead of re-booked.
pub const DEDUP_WINDOW_MS: i64 = 30_000;

/// Total-price tolerance for the duplicate guard, in percent.
pub const DEDUP_PRICE_TOLERANCE_PCT: i64 = 1;

/// Availability cache entry lifetime.
pub const CACHE_TTL_MS: i64 = 60_000;

/// Budget for acquiring one schedule write lock before failing fast with
/// a retryable Busy outcome.
pub const LOCK_WAIT_MS: u64 = 2_000;

/// Upper bound on a single WAL record; replay treats larger length
/// prefixes as corruption.
pub const MAX_WAL_RECORD_BYTES: usize = 1 << 20;
