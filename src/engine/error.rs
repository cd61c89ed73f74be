use ulid::Ulid;

use crate::model::{BookingStatus, Day, Minute, TimeRange};

/// Who holds a conflicting range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupant {
    Booking(Ulid),
    Maintenance,
}

/// Structured description of a detected conflict: the first occupied range
/// overlapping the request, and who holds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInfo {
    pub sub_field_id: Ulid,
    pub day: Day,
    pub requested: TimeRange,
    pub occupied: TimeRange,
    pub occupied_by: Occupant,
}

#[derive(Debug)]
pub enum EngineError {
    /// A requested range overlaps an occupied slot. Expected under load;
    /// structured data, not a fault.
    Conflict(ConflictInfo),
    /// A schedule write lock could not be acquired within the wait
    /// budget. Retryable; the same user-visible outcome as a conflict.
    Busy,
    /// Rejected before any lock was taken.
    Validation(&'static str),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Maintenance transition attempted on a booked slot.
    BookedSlot(Ulid),
    InvalidTransition { booking: Ulid, from: BookingStatus },
    LimitExceeded(&'static str),
    Wal(String),
}

impl EngineError {
    /// Outcomes the interactive caller surfaces as "slot already taken,
    /// please retry" (HTTP 409).
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict(_) | EngineError::Busy)
    }
}

fn hhmm(m: Minute) -> String {
    format!("{:02}:{:02}", m / 60, m % 60)
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Conflict(c) => {
                let holder = match c.occupied_by {
                    Occupant::Booking(id) => format!("booking {id}"),
                    Occupant::Maintenance => "maintenance".to_string(),
                };
                write!(
                    f,
                    "conflict on sub-field {} day {}: requested [{}, {}) overlaps [{}, {}) held by {holder}",
                    c.sub_field_id,
                    c.day,
                    hhmm(c.requested.start),
                    hhmm(c.requested.end),
                    hhmm(c.occupied.start),
                    hhmm(c.occupied.end),
                )
            }
            EngineError::Busy => write!(f, "schedule lock wait timed out, retry"),
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::BookedSlot(id) => {
                write!(f, "cannot change maintenance status of booked slot {id}")
            }
            EngineError::InvalidTransition { booking, from } => {
                write!(f, "invalid transition for booking {booking} from {from:?}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Wal(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
