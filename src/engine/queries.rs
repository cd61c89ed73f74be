use ulid::Ulid;

use crate::model::*;
use crate::observability::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};

use super::conflict::{now_ms, validate_day};
use super::{Engine, EngineError};

impl Engine {
    /// Occupied ranges for a field on a day, read through the
    /// availability cache. The authoritative conflict checks in the write
    /// paths never use this.
    pub async fn get_occupied(
        &self,
        field_id: Ulid,
        day: Day,
    ) -> Result<Vec<OccupiedRange>, EngineError> {
        if !self.field_exists(&field_id) {
            return Err(EngineError::NotFound(field_id));
        }
        validate_day(day)?;

        let now = now_ms();
        if let Some(hit) = self.cache.get(field_id, day, now) {
            metrics::counter!(CACHE_HITS_TOTAL).increment(1);
            return Ok(hit);
        }
        metrics::counter!(CACHE_MISSES_TOTAL).increment(1);

        // Capture the version before scanning: a commit landing mid-scan
        // bumps it and our snapshot will be refused by the cache.
        let version = self.cache.version(field_id, day);
        let mut occupied = Vec::new();
        for sub_field_id in self.sub_field_ids(&field_id) {
            let key = ScheduleKey { sub_field_id, day };
            let Some(shared) = self.schedule_if_exists(&key) else { continue };
            let guard = shared.read().await;
            for slot in &guard.slots {
                occupied.push(OccupiedRange {
                    sub_field_id,
                    slot_id: slot.id,
                    range: slot.range,
                    status: if slot.is_maintenance() {
                        OccupancyStatus::Maintenance
                    } else {
                        OccupancyStatus::Booked
                    },
                    booking_id: slot.booking_id(),
                });
            }
        }
        occupied.sort_by_key(|o| (o.sub_field_id, o.range.start));

        self.cache.insert(field_id, day, occupied.clone(), version, now);
        Ok(occupied)
    }

    pub fn get_booking(&self, id: &Ulid) -> Option<Booking> {
        self.booking_snapshot(id)
    }

    pub fn list_fields(&self) -> Vec<Field> {
        let mut fields = self.fields_snapshot();
        fields.sort_by_key(|f| f.id);
        fields
    }

    pub fn list_sub_fields(&self, field_id: &Ulid) -> Vec<SubField> {
        self.sub_field_ids(field_id)
            .iter()
            .filter_map(|sid| self.sub_field_snapshot(sid))
            .collect()
    }

    /// Slot rows for one schedule, in start order. Admin tooling and
    /// tests; bypasses the cache.
    pub async fn slots_on(&self, sub_field_id: Ulid, day: Day) -> Vec<Slot> {
        let key = ScheduleKey { sub_field_id, day };
        match self.schedule_if_exists(&key) {
            Some(shared) => shared.read().await.slots.clone(),
            None => Vec::new(),
        }
    }
}
