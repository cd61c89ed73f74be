use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::{DEDUP_PRICE_TOLERANCE_PCT, DEDUP_WINDOW_MS};
use crate::model::{Day, Ms};

/// Normalize a customer email for dedup matching: trimmed, lowercased,
/// matched by exact equality.
pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

#[derive(Debug, Clone)]
struct Submission {
    booking_id: Ulid,
    field_id: Ulid,
    day: Day,
    total_price_cents: i64,
    at: Ms,
}

/// Duplicate Submission Guard: absorbs client-side retries and
/// double-clicks by remembering recent successful submissions per
/// normalized customer email.
///
/// Advisory only — the reservation path's locking remains the authority
/// against double occupancy; this guard only prevents a second successful
/// booking for the same intent inside the trailing window.
pub struct DuplicateGuard {
    recent: DashMap<String, Vec<Submission>>,
}

impl Default for DuplicateGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Totals match when they differ by at most the configured tolerance of
/// the earlier total.
fn within_price_tolerance(earlier: i64, later: i64) -> bool {
    (earlier - later).abs() * 100 <= earlier.abs() * DEDUP_PRICE_TOLERANCE_PCT
}

impl DuplicateGuard {
    pub fn new() -> Self {
        Self { recent: DashMap::new() }
    }

    /// Prior booking id for the same intent (same email, field, day, total
    /// within tolerance) submitted inside the window, if any. Stale
    /// entries for the email are pruned on the way through.
    pub fn check(
        &self,
        email: &str,
        field_id: Ulid,
        day: Day,
        total_price_cents: i64,
        now: Ms,
    ) -> Option<Ulid> {
        let key = normalize_email(email);
        let mut entry = self.recent.get_mut(&key)?;
        entry.retain(|s| now - s.at < DEDUP_WINDOW_MS);
        entry
            .iter()
            .find(|s| {
                s.field_id == field_id
                    && s.day == day
                    && within_price_tolerance(s.total_price_cents, total_price_cents)
            })
            .map(|s| s.booking_id)
    }

    /// Record a committed submission.
    pub fn note(
        &self,
        email: &str,
        field_id: Ulid,
        day: Day,
        total_price_cents: i64,
        booking_id: Ulid,
        now: Ms,
    ) {
        let mut entry = self.recent.entry(normalize_email(email)).or_default();
        entry.retain(|s| now - s.at < DEDUP_WINDOW_MS);
        entry.push(Submission { booking_id, field_id, day, total_price_cents, at: now });
    }
}
