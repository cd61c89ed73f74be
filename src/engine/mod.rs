mod conflict;
mod error;
mod maintenance;
mod queries;
mod reserve;

pub use error::{ConflictInfo, EngineError, Occupant};
pub use maintenance::MaintenanceOutcome;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::cache::AvailabilityCache;
use crate::dedup::DuplicateGuard;
use crate::limits::*;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedSchedule = Arc<RwLock<ScheduleState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush the batch first, then handle the
                            // non-append command.
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The reservation engine: the one writer for its data directory.
///
/// Per-(sub-field, day) write locks are the mutual-exclusion authority;
/// the WAL is the durability authority. Every mutation acquires its
/// schedule locks in key order, re-validates under them, appends exactly
/// one WAL record, then applies in memory — so replay and live state can
/// never disagree about what committed.
pub struct Engine {
    schedules: DashMap<ScheduleKey, SharedSchedule>,
    fields: DashMap<Ulid, Field>,
    sub_fields: DashMap<Ulid, SubField>,
    /// Field → its sub-fields, for occupancy fan-out.
    field_subs: DashMap<Ulid, Vec<Ulid>>,
    /// All bookings ever committed; cancellation never removes entries.
    bookings: DashMap<Ulid, Booking>,
    /// Slot id → the schedule holding its row.
    slot_index: DashMap<Ulid, ScheduleKey>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(crate) cache: AvailabilityCache,
    pub(crate) dedup: DuplicateGuard,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            schedules: DashMap::new(),
            fields: DashMap::new(),
            sub_fields: DashMap::new(),
            field_subs: DashMap::new(),
            bookings: DashMap::new(),
            slot_index: DashMap::new(),
            wal_tx,
            notify,
            cache: AvailabilityCache::new(),
            dedup: DuplicateGuard::new(),
        };

        // Replay — we're the sole owner of every schedule Arc here, so
        // try_write always succeeds instantly. Never block_on a lock in
        // this path: it may run inside an async context.
        for event in &events {
            match event {
                Event::FieldCreated { id, name } => {
                    engine.fields.insert(*id, Field { id: *id, name: name.clone() });
                    engine.field_subs.entry(*id).or_default();
                }
                Event::SubFieldCreated { id, field_id, name } => {
                    engine
                        .sub_fields
                        .insert(*id, SubField { id: *id, field_id: *field_id, name: name.clone() });
                    engine.field_subs.entry(*field_id).or_default().push(*id);
                }
                Event::ReservationCommitted { booking, slots } => {
                    engine.bookings.insert(booking.id, booking.clone());
                    for rec in slots {
                        let shared = engine.schedule(&rec.key);
                        let mut guard = shared.try_write().expect("replay: uncontended write");
                        engine.attach_slot(&mut guard, rec);
                    }
                }
                Event::MaintenanceSet { slots } => {
                    for rec in slots {
                        let shared = engine.schedule(&rec.key);
                        let mut guard = shared.try_write().expect("replay: uncontended write");
                        engine.attach_slot(&mut guard, rec);
                    }
                }
                Event::MaintenanceCleared { slot_ids } => {
                    for sid in slot_ids {
                        engine.detach_slot_replay(*sid);
                    }
                }
                Event::BookingConfirmed { id } => engine.apply_confirmation(*id),
                Event::BookingCancelled { id, reason, released_slots } => {
                    for sid in released_slots {
                        engine.detach_slot_replay(*sid);
                    }
                    engine.apply_cancellation(*id, *reason);
                }
                Event::BookingCompleted { id } => engine.apply_completion(*id),
            }
        }

        Ok(engine)
    }

    /// Write an event through the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event: event.clone(), response: tx })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    /// The schedule for a key, created lazily. Callers must have validated
    /// that the sub-field exists.
    pub(super) fn schedule(&self, key: &ScheduleKey) -> SharedSchedule {
        self.schedules
            .entry(*key)
            .or_insert_with(|| Arc::new(RwLock::new(ScheduleState::new(*key))))
            .clone()
    }

    /// Acquire write locks on the given schedules, which must be sorted
    /// and deduped — locking in key order makes deadlock impossible. Each
    /// acquisition is bounded; exceeding the budget fails fast with `Busy`
    /// rather than keeping a caller waiting behind a slow holder.
    pub(super) async fn lock_schedules(
        &self,
        keys: &[ScheduleKey],
    ) -> Result<Vec<OwnedRwLockWriteGuard<ScheduleState>>, EngineError> {
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let shared = self.schedule(key);
            match tokio::time::timeout(Duration::from_millis(LOCK_WAIT_MS), shared.write_owned())
                .await
            {
                Ok(guard) => guards.push(guard),
                Err(_) => return Err(EngineError::Busy),
            }
        }
        Ok(guards)
    }

    /// Post-commit step shared by every occupancy write: drop the cache
    /// entry, then tell listeners what changed.
    pub(super) fn post_commit(&self, field_id: Ulid, day: Day, changes: Vec<SlotChange>) {
        self.cache.invalidate(field_id, day);
        self.notify.send(OccupancyChanged { field_id, day, changes });
    }

    // ── Registry ─────────────────────────────────────────────

    pub async fn create_field(&self, id: Ulid, name: &str) -> Result<(), EngineError> {
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("field name too long"));
        }
        if self.fields.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let event = Event::FieldCreated { id, name: name.to_string() };
        self.wal_append(&event).await?;
        self.fields.insert(id, Field { id, name: name.to_string() });
        self.field_subs.entry(id).or_default();
        Ok(())
    }

    pub async fn create_sub_field(
        &self,
        id: Ulid,
        field_id: Ulid,
        name: &str,
    ) -> Result<(), EngineError> {
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("sub-field name too long"));
        }
        if !self.fields.contains_key(&field_id) {
            return Err(EngineError::NotFound(field_id));
        }
        if self.sub_fields.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if let Some(subs) = self.field_subs.get(&field_id)
            && subs.len() >= MAX_SUB_FIELDS_PER_FIELD {
                return Err(EngineError::LimitExceeded("too many sub-fields on field"));
            }
        let event = Event::SubFieldCreated { id, field_id, name: name.to_string() };
        self.wal_append(&event).await?;
        self.sub_fields
            .insert(id, SubField { id, field_id, name: name.to_string() });
        self.field_subs.entry(field_id).or_default().push(id);
        Ok(())
    }

    pub(super) fn field_of_sub(&self, sub_field_id: &Ulid) -> Option<Ulid> {
        self.sub_fields.get(sub_field_id).map(|e| e.field_id)
    }

    pub(super) fn sub_field_ids(&self, field_id: &Ulid) -> Vec<Ulid> {
        self.field_subs
            .get(field_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub(super) fn slot_key(&self, slot_id: &Ulid) -> Option<ScheduleKey> {
        self.slot_index.get(slot_id).map(|e| *e.value())
    }

    pub(super) fn schedule_if_exists(&self, key: &ScheduleKey) -> Option<SharedSchedule> {
        self.schedules.get(key).map(|e| e.value().clone())
    }

    pub(super) fn field_exists(&self, field_id: &Ulid) -> bool {
        self.fields.contains_key(field_id)
    }

    pub(super) fn booking_snapshot(&self, id: &Ulid) -> Option<Booking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    pub(super) fn insert_booking(&self, booking: Booking) {
        self.bookings.insert(booking.id, booking);
    }

    pub(super) fn fields_snapshot(&self) -> Vec<Field> {
        self.fields.iter().map(|e| e.value().clone()).collect()
    }

    pub(super) fn sub_fields_snapshot(&self) -> Vec<SubField> {
        self.sub_fields.iter().map(|e| e.value().clone()).collect()
    }

    pub(super) fn sub_field_snapshot(&self, id: &Ulid) -> Option<SubField> {
        self.sub_fields.get(id).map(|e| e.value().clone())
    }

    // ── Shared event application ─────────────────────────────
    //
    // Used by both the live mutation paths (holding the schedule write
    // lock) and replay (uncontended try_write), so the two can't diverge.

    pub(super) fn attach_slot(&self, rs: &mut ScheduleState, rec: &SlotRecord) {
        rs.insert_slot(rec.slot.clone());
        self.slot_index.insert(rec.slot.id, rec.key);
    }

    pub(super) fn detach_slot(&self, rs: &mut ScheduleState, slot_id: Ulid) -> Option<Slot> {
        let removed = rs.remove_slot(slot_id);
        if removed.is_some() {
            self.slot_index.remove(&slot_id);
        }
        removed
    }

    /// Replay-only: locate and remove a slot row by id. Missing rows are
    /// fine (the record may predate a compaction that dropped them).
    fn detach_slot_replay(&self, slot_id: Ulid) {
        if let Some((_, key)) = self.slot_index.remove(&slot_id)
            && let Some(shared) = self.schedule_if_exists(&key) {
                let mut guard = shared.try_write().expect("replay: uncontended write");
                guard.remove_slot(slot_id);
            }
    }

    pub(super) fn apply_confirmation(&self, id: Ulid) {
        if let Some(mut b) = self.bookings.get_mut(&id) {
            b.status = BookingStatus::Confirmed;
            b.payment_status = PaymentStatus::Paid;
        }
    }

    pub(super) fn apply_cancellation(&self, id: Ulid, reason: CancelReason) {
        if let Some(mut b) = self.bookings.get_mut(&id) {
            b.status = BookingStatus::Cancelled;
            b.payment_status = match reason {
                CancelReason::PaymentFailed => PaymentStatus::Failed,
                CancelReason::Released if b.payment_status == PaymentStatus::Paid => {
                    PaymentStatus::Refunded
                }
                _ => b.payment_status,
            };
            b.slot_ids.clear();
        }
    }

    pub(super) fn apply_completion(&self, id: Ulid) {
        if let Some(mut b) = self.bookings.get_mut(&id) {
            b.status = BookingStatus::Completed;
        }
    }

    // ── Sweeper support ──────────────────────────────────────

    /// Customer bookings still awaiting payment past the timeout.
    pub fn collect_expired_bookings(&self, now: Ms) -> Vec<Ulid> {
        self.bookings
            .iter()
            .filter(|e| {
                let b = e.value();
                b.customer.is_some()
                    && b.awaiting_payment()
                    && now - b.created_at >= PAYMENT_TIMEOUT_MS
            })
            .map(|e| *e.key())
            .collect()
    }

    // ── Maintenance of the log itself ────────────────────────

    /// Drop in-memory schedules for days before `cutoff`. Bookings stay
    /// for audit; a subsequent compaction makes the pruning durable.
    /// Schedules under an active lock are left for the next run.
    pub fn gc_past_days(&self, cutoff: Day) -> usize {
        let old_keys: Vec<ScheduleKey> = self
            .schedules
            .iter()
            .filter(|e| e.key().day < cutoff)
            .map(|e| *e.key())
            .collect();

        let mut dropped = 0;
        for key in old_keys {
            let Some(shared) = self.schedule_if_exists(&key) else { continue };
            let Ok(guard) = shared.try_read() else { continue };
            for slot in &guard.slots {
                self.slot_index.remove(&slot.id);
            }
            drop(guard);
            self.schedules.remove(&key);
            dropped += 1;
        }
        dropped
    }

    /// Rewrite the WAL with only the events needed to recreate current
    /// state. Cancelled and completed bookings are kept (audit trail);
    /// each booking is rewritten with its live slot rows so the log stays
    /// self-consistent after GC.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        for field in self.fields_snapshot() {
            events.push(Event::FieldCreated { id: field.id, name: field.name });
        }
        for sub in self.sub_fields_snapshot() {
            events.push(Event::SubFieldCreated { id: sub.id, field_id: sub.field_id, name: sub.name });
        }

        let mut maintenance = Vec::new();
        let keys: Vec<ScheduleKey> = self.schedules.iter().map(|e| *e.key()).collect();
        for key in &keys {
            let Some(shared) = self.schedule_if_exists(key) else { continue };
            let guard = shared.try_read().expect("compact: uncontended read");
            for slot in &guard.slots {
                if slot.is_maintenance() {
                    maintenance.push(SlotRecord { key: *key, slot: slot.clone() });
                }
            }
        }
        if !maintenance.is_empty() {
            events.push(Event::MaintenanceSet { slots: maintenance });
        }

        let booking_ids: Vec<Ulid> = self.bookings.iter().map(|e| *e.key()).collect();
        for id in booking_ids {
            let Some(mut booking) = self.booking_snapshot(&id) else { continue };
            let mut slots = Vec::new();
            for sid in &booking.slot_ids {
                if let Some(key) = self.slot_key(sid)
                    && let Some(shared) = self.schedule_if_exists(&key) {
                        let guard = shared.try_read().expect("compact: uncontended read");
                        if let Some(slot) = guard.slots.iter().find(|s| s.id == *sid) {
                            slots.push(SlotRecord { key, slot: slot.clone() });
                        }
                    }
            }
            booking.slot_ids = slots.iter().map(|r| r.slot.id).collect();
            events.push(Event::ReservationCommitted { booking, slots });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
