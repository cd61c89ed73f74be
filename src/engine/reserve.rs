use std::collections::HashMap;

use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{CONFLICTS_TOTAL, DEDUP_HITS_TOTAL, RESERVATIONS_TOTAL};

use super::conflict::{first_conflict, intra_request_overlap, now_ms, validate_day, validate_range};
use super::{Engine, EngineError};

impl Engine {
    /// The atomic reservation transaction: either one booking plus one
    /// booked slot row per requested range commits, or nothing does.
    ///
    /// validate → duplicate guard → lock schedules in key order →
    /// re-check conflicts under lock → one WAL record → apply →
    /// invalidate cache + notify.
    pub async fn reserve(&self, req: ReservationRequest) -> Result<Booking, EngineError> {
        self.validate_reservation(&req)?;
        let now = now_ms();

        // Advisory resubmission check. The locking below stays the
        // authority against double occupancy; this only absorbs retries
        // of an already-successful submission.
        if let Some(customer) = &req.customer
            && let Some(prior) = self.dedup.check(
                &customer.email,
                req.field_id,
                req.day,
                req.total_price_cents,
                now,
            )
            && let Some(existing) = self.booking_snapshot(&prior)
            && existing.status != BookingStatus::Cancelled
        {
            metrics::counter!(DEDUP_HITS_TOTAL).increment(1);
            info!("absorbed resubmission of booking {prior}");
            return Ok(existing);
        }

        let mut keys: Vec<ScheduleKey> = req
            .ranges
            .iter()
            .map(|r| ScheduleKey { sub_field_id: r.sub_field_id, day: req.day })
            .collect();
        keys.sort();
        keys.dedup();
        let guard_of: HashMap<ScheduleKey, usize> =
            keys.iter().enumerate().map(|(i, k)| (*k, i)).collect();

        let mut guards = match self.lock_schedules(&keys).await {
            Ok(guards) => guards,
            Err(e) => {
                if e.is_conflict() {
                    metrics::counter!(CONFLICTS_TOTAL).increment(1);
                }
                return Err(e);
            }
        };

        // Re-check against authoritative state under the locks. Request
        // order decides which conflict is reported first.
        let mut added_per_key: HashMap<ScheduleKey, usize> = HashMap::new();
        for rr in &req.ranges {
            let key = ScheduleKey { sub_field_id: rr.sub_field_id, day: req.day };
            let guard = &guards[guard_of[&key]];
            if let Some(conflict) = first_conflict(guard, &rr.range) {
                metrics::counter!(CONFLICTS_TOTAL).increment(1);
                return Err(EngineError::Conflict(conflict));
            }
            *added_per_key.entry(key).or_default() += 1;
        }
        for (key, added) in &added_per_key {
            if guards[guard_of[key]].slots.len() + added > MAX_SLOTS_PER_SCHEDULE {
                return Err(EngineError::LimitExceeded("too many slots on schedule"));
            }
        }

        let booking_id = Ulid::new();
        let slots: Vec<SlotRecord> = req
            .ranges
            .iter()
            .map(|rr| SlotRecord {
                key: ScheduleKey { sub_field_id: rr.sub_field_id, day: req.day },
                slot: Slot {
                    id: Ulid::new(),
                    range: rr.range,
                    kind: SlotKind::Booked { booking_id },
                    price_multiplier: rr.price_multiplier,
                    created_at: now,
                },
            })
            .collect();

        // Owner bookings settle off-platform: confirmed immediately and
        // never swept. Customer bookings wait for the payment event.
        let (status, payment_status) = if req.customer.is_some() {
            (BookingStatus::PaymentPending, PaymentStatus::Pending)
        } else {
            (BookingStatus::Confirmed, PaymentStatus::Pending)
        };
        let booking = Booking {
            id: booking_id,
            field_id: req.field_id,
            day: req.day,
            customer: req.customer.clone(),
            status,
            payment_status,
            total_price_cents: req.total_price_cents,
            created_at: now,
            slot_ids: slots.iter().map(|r| r.slot.id).collect(),
        };

        let event = Event::ReservationCommitted { booking: booking.clone(), slots: slots.clone() };
        self.wal_append(&event).await?;

        for rec in &slots {
            self.attach_slot(&mut guards[guard_of[&rec.key]], rec);
        }
        self.insert_booking(booking.clone());
        if let Some(customer) = &req.customer {
            self.dedup.note(
                &customer.email,
                req.field_id,
                req.day,
                req.total_price_cents,
                booking_id,
                now,
            );
        }
        drop(guards);

        metrics::counter!(RESERVATIONS_TOTAL).increment(1);
        self.post_commit(
            req.field_id,
            req.day,
            slots
                .iter()
                .map(|r| SlotChange {
                    sub_field_id: r.key.sub_field_id,
                    range: r.slot.range,
                    status: ChangeKind::Booked,
                })
                .collect(),
        );
        info!("reserved booking {booking_id} ({} slots)", slots.len());
        Ok(booking)
    }

    fn validate_reservation(&self, req: &ReservationRequest) -> Result<(), EngineError> {
        validate_day(req.day)?;
        if req.ranges.is_empty() {
            return Err(EngineError::Validation("no ranges requested"));
        }
        if req.ranges.len() > MAX_RANGES_PER_RESERVATION {
            return Err(EngineError::LimitExceeded("too many ranges in reservation"));
        }
        if req.total_price_cents < 0 {
            return Err(EngineError::Validation("negative total price"));
        }
        if let Some(customer) = &req.customer {
            if customer.email.trim().is_empty() {
                return Err(EngineError::Validation("empty customer email"));
            }
            if customer.email.len() > MAX_EMAIL_LEN {
                return Err(EngineError::LimitExceeded("customer email too long"));
            }
            if customer.name.len() > MAX_CONTACT_FIELD_LEN
                || customer.phone.len() > MAX_CONTACT_FIELD_LEN
            {
                return Err(EngineError::LimitExceeded("contact field too long"));
            }
        }
        if !self.field_exists(&req.field_id) {
            return Err(EngineError::NotFound(req.field_id));
        }
        for rr in &req.ranges {
            validate_range(&rr.range)?;
            match self.field_of_sub(&rr.sub_field_id) {
                None => return Err(EngineError::NotFound(rr.sub_field_id)),
                Some(fid) if fid != req.field_id => {
                    return Err(EngineError::Validation("sub-field not part of requested field"));
                }
                Some(_) => {}
            }
        }
        if intra_request_overlap(&req.ranges) {
            return Err(EngineError::Validation("overlapping ranges in request"));
        }
        Ok(())
    }

    // ── Booking lifecycle ────────────────────────────────────

    /// Explicit cancellation: release the booking's slots and mark it
    /// cancelled. Idempotent on an already-cancelled booking.
    pub async fn release(&self, booking_id: Ulid) -> Result<(), EngineError> {
        self.cancel_and_release(booking_id, CancelReason::Released, false).await
    }

    /// Payment collaborator reported success.
    pub async fn payment_succeeded(&self, booking_id: Ulid) -> Result<(), EngineError> {
        let booking = self
            .booking_snapshot(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        match booking.status {
            BookingStatus::Pending | BookingStatus::PaymentPending => {}
            BookingStatus::Confirmed => return Ok(()), // duplicate event
            from => return Err(EngineError::InvalidTransition { booking: booking_id, from }),
        }

        // Serialize with the sweeper on the slot locks so confirmation
        // and expiry cannot interleave.
        let keys = self.booking_schedule_keys(&booking);
        let _guards = self.lock_schedules(&keys).await?;
        let current = self
            .booking_snapshot(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        match current.status {
            BookingStatus::Pending | BookingStatus::PaymentPending => {}
            BookingStatus::Confirmed => return Ok(()),
            from => return Err(EngineError::InvalidTransition { booking: booking_id, from }),
        }

        let event = Event::BookingConfirmed { id: booking_id };
        self.wal_append(&event).await?;
        self.apply_confirmation(booking_id);
        info!("booking {booking_id} confirmed");
        Ok(())
    }

    /// Payment collaborator reported failure: cancel and release, exactly
    /// as the expiry sweeper does.
    pub async fn payment_failed(&self, booking_id: Ulid) -> Result<(), EngineError> {
        self.cancel_and_release(booking_id, CancelReason::PaymentFailed, true).await
    }

    /// Payment collaborator reported the customer abandoned checkout.
    pub async fn payment_cancelled(&self, booking_id: Ulid) -> Result<(), EngineError> {
        self.cancel_and_release(booking_id, CancelReason::PaymentCancelled, true).await
    }

    /// Sweeper entry: reclaim a booking that never completed payment.
    pub(crate) async fn expire_booking(&self, booking_id: Ulid) -> Result<(), EngineError> {
        self.cancel_and_release(booking_id, CancelReason::Expired, true).await
    }

    /// External status scheduler: the booking's time range is in the past.
    pub async fn mark_completed(&self, booking_id: Ulid) -> Result<(), EngineError> {
        let booking = self
            .booking_snapshot(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        match booking.status {
            BookingStatus::Confirmed => {}
            BookingStatus::Completed => return Ok(()),
            from => return Err(EngineError::InvalidTransition { booking: booking_id, from }),
        }
        let event = Event::BookingCompleted { id: booking_id };
        self.wal_append(&event).await?;
        self.apply_completion(booking_id);
        Ok(())
    }

    fn booking_schedule_keys(&self, booking: &Booking) -> Vec<ScheduleKey> {
        let mut keys: Vec<ScheduleKey> = booking
            .slot_ids
            .iter()
            .filter_map(|sid| self.slot_key(sid))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Cancel + release as one committed unit: the WAL record carries both
    /// the status change and the released slot ids, so replay can never
    /// see a slot freed while its booking is still awaiting payment.
    async fn cancel_and_release(
        &self,
        booking_id: Ulid,
        reason: CancelReason,
        require_awaiting: bool,
    ) -> Result<(), EngineError> {
        let booking = self
            .booking_snapshot(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        match booking.status {
            BookingStatus::Cancelled => return Ok(()),
            BookingStatus::Completed => {
                return Err(EngineError::InvalidTransition {
                    booking: booking_id,
                    from: BookingStatus::Completed,
                });
            }
            _ => {}
        }
        if require_awaiting && !booking.awaiting_payment() {
            return Err(EngineError::InvalidTransition { booking: booking_id, from: booking.status });
        }

        let keys = self.booking_schedule_keys(&booking);
        let mut guards = self.lock_schedules(&keys).await?;

        // Re-read under the locks: a payment event or another release may
        // have won the race.
        let current = self
            .booking_snapshot(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        match current.status {
            BookingStatus::Cancelled => return Ok(()),
            BookingStatus::Completed => {
                return Err(EngineError::InvalidTransition {
                    booking: booking_id,
                    from: BookingStatus::Completed,
                });
            }
            _ => {}
        }
        if require_awaiting && !current.awaiting_payment() {
            return Err(EngineError::InvalidTransition { booking: booking_id, from: current.status });
        }

        let event = Event::BookingCancelled {
            id: booking_id,
            reason,
            released_slots: current.slot_ids.clone(),
        };
        self.wal_append(&event).await?;

        let mut changes = Vec::new();
        for guard in guards.iter_mut() {
            let sub_field_id = guard.key.sub_field_id;
            let mine: Vec<Ulid> = guard
                .slots
                .iter()
                .filter(|s| s.booking_id() == Some(booking_id))
                .map(|s| s.id)
                .collect();
            for sid in mine {
                if let Some(slot) = self.detach_slot(guard, sid) {
                    changes.push(SlotChange {
                        sub_field_id,
                        range: slot.range,
                        status: ChangeKind::Released,
                    });
                }
            }
        }
        self.apply_cancellation(booking_id, reason);
        drop(guards);

        self.post_commit(current.field_id, current.day, changes);
        info!("booking {booking_id} cancelled ({reason:?})");
        Ok(())
    }
}
