use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for LISTEN/NOTIFY per resource. Payloads are the JSON
/// encoding of the committed event, so in-process consumers and wire
/// clients see the same document.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<String>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a resource. Creates the channel if needed.
    pub fn subscribe(&self, resource_id: Ulid) -> broadcast::Receiver<String> {
        let sender = self
            .channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, resource_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&resource_id) {
            if let Ok(payload) = serde_json::to_string(event) {
                let _ = sender.send(payload);
            }
        }
    }

    /// Remove a channel when its resource is deleted.
    pub fn remove(&self, resource_id: &Ulid) {
        self.channels.remove(resource_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive_json() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let mut rx = hub.subscribe(rid);

        let event = Event::ResourceDeleted { id: rid };
        hub.send(rid, &event);

        let payload = rx.recv().await.unwrap();
        let decoded: Event = serde_json::from_str(&payload).unwrap();
        assert_eq!(decoded, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        // No subscriber — should not panic
        hub.send(rid, &Event::ResourceDeleted { id: rid });
    }
}
