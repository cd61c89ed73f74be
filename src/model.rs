use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the wall-clock time type.
pub type Ms = i64;

/// Days since the Unix epoch — the calendar-date type.
pub type Day = i32;

/// Minutes since midnight — the intra-day time type.
pub type Minute = i32;

/// Half-open time range `[start, end)` in minutes since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Minute,
    pub end: Minute,
}

impl TimeRange {
    pub fn new(start: Minute, end: Minute) -> Self {
        Self { start, end }
    }

    /// Half-open overlap: touching endpoints do not conflict.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn duration_min(&self) -> Minute {
        self.end - self.start
    }
}

/// The unit of locking and slot storage: one sub-field on one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScheduleKey {
    pub sub_field_id: Ulid,
    pub day: Day,
}

/// What occupies a slot. There is no `Available` variant: an unoccupied
/// unit of time has no slot row at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SlotKind {
    Booked {
        booking_id: Ulid,
    },
    Maintenance {
        reason: String,
        estimated_done: Option<Ms>,
    },
}

/// One occupied (sub-field, day, time-range) unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub range: TimeRange,
    pub kind: SlotKind,
    /// Supplied by the pricing collaborator; stored, never computed here.
    pub price_multiplier: f64,
    pub created_at: Ms,
}

impl Slot {
    pub fn booking_id(&self) -> Option<Ulid> {
        match &self.kind {
            SlotKind::Booked { booking_id } => Some(*booking_id),
            SlotKind::Maintenance { .. } => None,
        }
    }

    pub fn is_maintenance(&self) -> bool {
        matches!(self.kind, SlotKind::Maintenance { .. })
    }
}

/// A slot together with the schedule it belongs to — the shape slots take
/// in WAL records and operation results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotRecord {
    pub key: ScheduleKey,
    pub slot: Slot,
}

/// All occupied slots of one schedule, sorted by `range.start`.
#[derive(Debug, Clone)]
pub struct ScheduleState {
    pub key: ScheduleKey,
    pub slots: Vec<Slot>,
}

impl ScheduleState {
    pub fn new(key: ScheduleKey) -> Self {
        Self { key, slots: Vec::new() }
    }

    /// Insert a slot maintaining sort order by range.start.
    pub fn insert_slot(&mut self, slot: Slot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.range.start, |s| s.range.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    pub fn remove_slot(&mut self, id: Ulid) -> Option<Slot> {
        let pos = self.slots.iter().position(|s| s.id == id)?;
        Some(self.slots.remove(pos))
    }

    /// Slots whose range overlaps the query, in start order. Binary search
    /// skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &TimeRange) -> impl Iterator<Item = &Slot> {
        let right_bound = self.slots.partition_point(|s| s.range.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.range.end > query.start)
    }
}

// ── Fields and sub-fields ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub id: Ulid,
    pub name: String,
}

/// An individually bookable physical unit within a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubField {
    pub id: Ulid,
    pub field_id: Ulid,
    pub name: String,
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    PaymentPending,
    Confirmed,
    Cancelled,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

/// Contact snapshot taken at reservation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerInfo {
    pub email: String,
    pub name: String,
    pub phone: String,
}

/// A customer's aggregate reservation. Owns its slots by id; the slot rows
/// live in the schedules. Never hard-deleted — cancellation empties
/// `slot_ids` and removes the rows, the booking itself stays for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub field_id: Ulid,
    pub day: Day,
    /// None marks an owner-created booking (settled off-platform).
    pub customer: Option<CustomerInfo>,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub total_price_cents: i64,
    pub created_at: Ms,
    pub slot_ids: Vec<Ulid>,
}

impl Booking {
    /// True while the expiry sweeper may still reclaim this booking.
    pub fn awaiting_payment(&self) -> bool {
        matches!(
            self.status,
            BookingStatus::Pending | BookingStatus::PaymentPending
        ) && self.payment_status == PaymentStatus::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    PaymentFailed,
    PaymentCancelled,
    Expired,
    Released,
}

// ── Requests ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RangeRequest {
    pub sub_field_id: Ulid,
    pub range: TimeRange,
    pub price_multiplier: f64,
}

#[derive(Debug, Clone)]
pub struct ReservationRequest {
    pub field_id: Ulid,
    pub day: Day,
    pub ranges: Vec<RangeRequest>,
    pub customer: Option<CustomerInfo>,
    pub total_price_cents: i64,
}

// ── WAL events ───────────────────────────────────────────────────

/// The durable record format. `ReservationCommitted` and
/// `BookingCancelled` are composite on purpose: a booking and its slot
/// rows commit (and replay) as one unit, so a crash can never leave one
/// without the other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    FieldCreated {
        id: Ulid,
        name: String,
    },
    SubFieldCreated {
        id: Ulid,
        field_id: Ulid,
        name: String,
    },
    ReservationCommitted {
        booking: Booking,
        slots: Vec<SlotRecord>,
    },
    MaintenanceSet {
        slots: Vec<SlotRecord>,
    },
    MaintenanceCleared {
        slot_ids: Vec<Ulid>,
    },
    BookingConfirmed {
        id: Ulid,
    },
    BookingCancelled {
        id: Ulid,
        reason: CancelReason,
        released_slots: Vec<Ulid>,
    },
    BookingCompleted {
        id: Ulid,
    },
}

// ── Query and notification result types ──────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OccupancyStatus {
    Booked,
    Maintenance,
}

/// One occupied range as reported by `get_occupied`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupiedRange {
    pub sub_field_id: Ulid,
    pub slot_id: Ulid,
    pub range: TimeRange,
    pub status: OccupancyStatus,
    pub booking_id: Option<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Booked,
    Maintenance,
    Released,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotChange {
    pub sub_field_id: Ulid,
    pub range: TimeRange,
    pub status: ChangeKind,
}

/// Broadcast to the realtime collaborator after every committed write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyChanged {
    pub field_id: Ulid,
    pub day: Day,
    pub changes: Vec<SlotChange>,
}
