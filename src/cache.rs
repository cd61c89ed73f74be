use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::CACHE_TTL_MS;
use crate::model::{Day, Ms, OccupiedRange};

struct CacheEntry {
    occupied: Vec<OccupiedRange>,
    version: u64,
    cached_at: Ms,
}

/// Short-TTL read cache of occupied ranges per (field, day).
///
/// An optimization only: authoritative conflict checks read the schedules
/// under lock and never consult this. Every committed write bumps the
/// key's version and drops the entry, so a snapshot taken before a commit
/// can never be served after it — even if the slow reader finishes its
/// scan (and stores it) after the invalidation. The TTL bounds staleness
/// for everything else.
pub struct AvailabilityCache {
    entries: DashMap<(Ulid, Day), CacheEntry>,
    versions: DashMap<(Ulid, Day), u64>,
}

impl Default for AvailabilityCache {
    fn default() -> Self {
        Self::new()
    }
}

impl AvailabilityCache {
    pub fn new() -> Self {
        Self { entries: DashMap::new(), versions: DashMap::new() }
    }

    /// Current version for the key. Capture this BEFORE scanning the
    /// schedules and pass it to `insert`.
    pub fn version(&self, field_id: Ulid, day: Day) -> u64 {
        self.versions.get(&(field_id, day)).map(|e| *e.value()).unwrap_or(0)
    }

    /// Fresh entry for the key, if any. Entries from a superseded version
    /// or past the TTL are dropped on the way out.
    pub fn get(&self, field_id: Ulid, day: Day, now: Ms) -> Option<Vec<OccupiedRange>> {
        let key = (field_id, day);
        {
            let entry = self.entries.get(&key)?;
            if entry.version == self.version(field_id, day) && now - entry.cached_at < CACHE_TTL_MS
            {
                return Some(entry.occupied.clone());
            }
        }
        self.entries.remove(&key);
        None
    }

    /// Store a snapshot taken while `version` was current. A commit that
    /// landed since then bumped the version, and `get` will refuse the
    /// entry.
    pub fn insert(
        &self,
        field_id: Ulid,
        day: Day,
        occupied: Vec<OccupiedRange>,
        version: u64,
        now: Ms,
    ) {
        self.entries
            .insert((field_id, day), CacheEntry { occupied, version, cached_at: now });
    }

    /// Synchronous post-commit invalidation.
    pub fn invalidate(&self, field_id: Ulid, day: Day) {
        let key = (field_id, day);
        *self.versions.entry(key).or_insert(0) += 1;
        self.entries.remove(&key);
    }
}
