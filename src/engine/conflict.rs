use crate::limits::*;
use crate::model::*;

use super::error::{ConflictInfo, EngineError, Occupant};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Reject malformed ranges before any lock is taken.
pub(crate) fn validate_range(range: &TimeRange) -> Result<(), EngineError> {
    if range.start < 0 || range.end > MINUTES_PER_DAY {
        return Err(EngineError::Validation("range outside day bounds"));
    }
    if range.start >= range.end {
        return Err(EngineError::Validation("empty or inverted range"));
    }
    Ok(())
}

pub(crate) fn validate_day(day: Day) -> Result<(), EngineError> {
    if !(MIN_VALID_DAY..=MAX_VALID_DAY).contains(&day) {
        return Err(EngineError::Validation("day out of range"));
    }
    Ok(())
}

/// The first occupied slot overlapping `requested`, in start order.
/// Pure: reusable under the schedule write lock (authoritative) and on
/// unlocked snapshots. Every slot row counts — a row exists only while
/// something occupies it.
pub(crate) fn first_conflict(rs: &ScheduleState, requested: &TimeRange) -> Option<ConflictInfo> {
    rs.overlapping(requested).next().map(|slot| ConflictInfo {
        sub_field_id: rs.key.sub_field_id,
        day: rs.key.day,
        requested: *requested,
        occupied: slot.range,
        occupied_by: match &slot.kind {
            SlotKind::Booked { booking_id } => Occupant::Booking(*booking_id),
            SlotKind::Maintenance { .. } => Occupant::Maintenance,
        },
    })
}

/// True if any two requested ranges on the same sub-field overlap each
/// other — a malformed request, caught before any lock.
pub(crate) fn intra_request_overlap(ranges: &[RangeRequest]) -> bool {
    for i in 0..ranges.len() {
        for j in (i + 1)..ranges.len() {
            if ranges[i].sub_field_id == ranges[j].sub_field_id
                && ranges[i].range.overlaps(&ranges[j].range)
            {
                return true;
            }
        }
    }
    false
}
