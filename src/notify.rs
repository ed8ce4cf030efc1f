use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub of committed changes, one channel per room.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to changes of a room. Creates the channel if needed.
    pub fn subscribe(&self, room_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Fan an event out to every room it touches. No-op if nobody is listening.
    pub fn publish(&self, event: &Event) {
        for room_id in event.room_ids() {
            if let Some(sender) = self.channels.get(&room_id) {
                let _ = sender.send(event.clone());
            }
        }
    }

    /// Drop channels whose subscribers have all gone away.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Room;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let room = Room::new("201", 2);
        let mut rx = hub.subscribe(room.id);

        let event = Event::RoomSaved { room: room.clone() };
        hub.publish(&event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        // No subscriber, nothing to deliver.
        hub.publish(&Event::RoomSaved {
            room: Room::new("202", 1),
        });
    }

    #[test]
    fn prune_drops_abandoned_channels() {
        let hub = NotifyHub::new();
        let room = Room::new("203", 1);
        let rx = hub.subscribe(room.id);
        drop(rx);
        hub.prune();
        assert!(hub.channels.is_empty());
    }
}
