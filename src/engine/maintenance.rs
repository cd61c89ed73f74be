use std::collections::HashMap;
use std::ops::RangeInclusive;

use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::MAINTENANCE_SLOTS_TOTAL;

use super::conflict::{first_conflict, now_ms, validate_day, validate_range};
use super::error::ConflictInfo;
use super::{Engine, EngineError};

/// What a ranged maintenance call did: rows created, and units skipped
/// because something already occupied the range there.
#[derive(Debug, Clone, PartialEq)]
pub struct MaintenanceOutcome {
    pub created: Vec<SlotRecord>,
    pub skipped: Vec<ConflictInfo>,
}

impl Engine {
    /// Put a time range under maintenance across sub-fields and days.
    ///
    /// Idle time has no slot row, so this creates rows directly in
    /// maintenance status. Units already overlapped by an existing slot
    /// are skipped and reported, never overridden — booked always wins.
    pub async fn set_maintenance(
        &self,
        sub_field_ids: &[Ulid],
        days: RangeInclusive<Day>,
        range: TimeRange,
        reason: &str,
        estimated_done: Option<Ms>,
    ) -> Result<MaintenanceOutcome, EngineError> {
        if reason.trim().is_empty() {
            return Err(EngineError::Validation("maintenance reason must not be empty"));
        }
        if reason.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("maintenance reason too long"));
        }
        validate_range(&range)?;
        if sub_field_ids.is_empty() {
            return Err(EngineError::Validation("no sub-fields given"));
        }
        if days.is_empty() {
            return Err(EngineError::Validation("empty day range"));
        }
        validate_day(*days.start())?;
        validate_day(*days.end())?;
        for sid in sub_field_ids {
            if self.field_of_sub(sid).is_none() {
                return Err(EngineError::NotFound(*sid));
            }
        }

        let mut keys = Vec::new();
        for &sub_field_id in sub_field_ids {
            for day in *days.start()..=*days.end() {
                keys.push(ScheduleKey { sub_field_id, day });
            }
        }
        keys.sort();
        keys.dedup();
        if keys.len() > MAX_MAINTENANCE_UNITS {
            return Err(EngineError::LimitExceeded("maintenance covers too many units"));
        }

        let mut guards = self.lock_schedules(&keys).await?;
        let guard_of: HashMap<ScheduleKey, usize> =
            keys.iter().enumerate().map(|(i, k)| (*k, i)).collect();

        let now = now_ms();
        let mut created = Vec::new();
        let mut skipped = Vec::new();
        for guard in guards.iter() {
            if let Some(existing) = first_conflict(guard, &range) {
                skipped.push(existing);
                continue;
            }
            if guard.slots.len() >= MAX_SLOTS_PER_SCHEDULE {
                return Err(EngineError::LimitExceeded("too many slots on schedule"));
            }
            created.push(SlotRecord {
                key: guard.key,
                slot: Slot {
                    id: Ulid::new(),
                    range,
                    kind: SlotKind::Maintenance {
                        reason: reason.to_string(),
                        estimated_done,
                    },
                    price_multiplier: 1.0,
                    created_at: now,
                },
            });
        }

        if created.is_empty() {
            return Ok(MaintenanceOutcome { created, skipped });
        }

        let event = Event::MaintenanceSet { slots: created.clone() };
        self.wal_append(&event).await?;
        for rec in &created {
            self.attach_slot(&mut guards[guard_of[&rec.key]], rec);
        }
        drop(guards);

        metrics::counter!(MAINTENANCE_SLOTS_TOTAL).increment(created.len() as u64);
        self.notify_slot_records(&created, ChangeKind::Maintenance);
        info!("maintenance set on {} units, {} skipped", created.len(), skipped.len());
        Ok(MaintenanceOutcome { created, skipped })
    }

    /// Flip one maintenance slot back to available — the row is removed
    /// and its reason/estimate go with it. A booked slot is a hard domain
    /// error, never a silent no-op.
    pub async fn toggle_maintenance(&self, slot_id: Ulid) -> Result<(), EngineError> {
        let key = self.slot_key(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        let mut guards = self.lock_schedules(&[key]).await?;
        let guard = &mut guards[0];

        let Some(slot) = guard.slots.iter().find(|s| s.id == slot_id) else {
            return Err(EngineError::NotFound(slot_id));
        };
        if !slot.is_maintenance() {
            return Err(EngineError::BookedSlot(slot_id));
        }

        let event = Event::MaintenanceCleared { slot_ids: vec![slot_id] };
        self.wal_append(&event).await?;
        let removed = self.detach_slot(guard, slot_id);
        drop(guards);

        if let Some(slot) = removed {
            self.notify_released(key, slot.range);
        }
        Ok(())
    }

    /// Batch removal of maintenance rows. Any booked or unknown id fails
    /// the whole batch before anything is written.
    pub async fn clear_maintenance(&self, slot_ids: &[Ulid]) -> Result<(), EngineError> {
        if slot_ids.is_empty() {
            return Err(EngineError::Validation("no slots given"));
        }
        let mut keys = Vec::with_capacity(slot_ids.len());
        for sid in slot_ids {
            keys.push(self.slot_key(sid).ok_or(EngineError::NotFound(*sid))?);
        }
        keys.sort();
        keys.dedup();
        let mut guards = self.lock_schedules(&keys).await?;

        for sid in slot_ids {
            let slot = guards
                .iter()
                .find_map(|g| g.slots.iter().find(|s| s.id == *sid))
                .ok_or(EngineError::NotFound(*sid))?;
            if !slot.is_maintenance() {
                return Err(EngineError::BookedSlot(*sid));
            }
        }

        let event = Event::MaintenanceCleared { slot_ids: slot_ids.to_vec() };
        self.wal_append(&event).await?;

        let mut removed = Vec::new();
        for guard in guards.iter_mut() {
            let key = guard.key;
            for sid in slot_ids {
                if let Some(slot) = self.detach_slot(guard, *sid) {
                    removed.push(SlotRecord { key, slot });
                }
            }
        }
        drop(guards);

        self.notify_slot_records(&removed, ChangeKind::Released);
        Ok(())
    }

    fn notify_released(&self, key: ScheduleKey, range: TimeRange) {
        if let Some(field_id) = self.field_of_sub(&key.sub_field_id) {
            self.post_commit(
                field_id,
                key.day,
                vec![SlotChange {
                    sub_field_id: key.sub_field_id,
                    range,
                    status: ChangeKind::Released,
                }],
            );
        }
    }

    /// One post-commit notification per affected (field, day).
    fn notify_slot_records(&self, records: &[SlotRecord], status: ChangeKind) {
        let mut grouped: HashMap<(Ulid, Day), Vec<SlotChange>> = HashMap::new();
        for rec in records {
            let Some(field_id) = self.field_of_sub(&rec.key.sub_field_id) else { continue };
            grouped.entry((field_id, rec.key.day)).or_default().push(SlotChange {
                sub_field_id: rec.key.sub_field_id,
                range: rec.slot.range,
                status,
            });
        }
        for ((field_id, day), changes) in grouped {
            self.post_commit(field_id, day, changes);
        }
    }
}
