use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::OccupancyChanged;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for occupancy-change notifications, one channel per
/// field. Delivery beyond this process (websockets, push) is the realtime
/// collaborator's job; this hub only fans out within the process.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<OccupancyChanged>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self { channels: DashMap::new() }
    }

    /// Subscribe to occupancy changes for a field. Creates the channel if
    /// needed.
    pub fn subscribe(&self, field_id: Ulid) -> broadcast::Receiver<OccupancyChanged> {
        let sender = self
            .channels
            .entry(field_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, change: OccupancyChanged) {
        if let Some(sender) = self.channels.get(&change.field_id) {
            let _ = sender.send(change);
        }
    }

    /// Remove a field's channel.
    #[allow(dead_code)]
    pub fn remove(&self, field_id: &Ulid) {
        self.channels.remove(field_id);
    }
}
