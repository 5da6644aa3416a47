//! Per-room event fan-out.
//!
//! Each room gets a broadcast channel on first subscribe. When the Redis
//! relay is up, events are published to Redis only and come back through
//! the relay, so every instance (this one included) sees each event once.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::connection::ConnectionStatus;
use crate::event::ChatEvent;

pub const CHANNEL_PREFIX: &str = "clovadrop:chat:";
pub const CHANNEL_PATTERN: &str = "clovadrop:chat:*";
pub const ROOM_CAPACITY: usize = 256;

pub fn channel_name(file_id: Uuid) -> String {
    format!("{}{}", CHANNEL_PREFIX, file_id)
}

pub fn room_from_channel(channel: &str) -> Option<Uuid> {
    channel
        .strip_prefix(CHANNEL_PREFIX)
        .and_then(|id| Uuid::parse_str(id).ok())
}

/// Outbound side of the cross-instance channel
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn send(&self, channel: &str, payload: String) -> Result<(), redis::RedisError>;
}

#[async_trait]
impl Publisher for ConnectionManager {
    async fn send(&self, channel: &str, payload: String) -> Result<(), redis::RedisError> {
        let mut conn = self.clone();
        conn.publish::<_, _, i64>(channel, payload).await.map(|_| ())
    }
}

pub struct ChatHub {
    capacity: usize,
    rooms: RwLock<HashMap<Uuid, broadcast::Sender<ChatEvent>>>,
    publisher: Option<Arc<dyn Publisher>>,
    relay_status: watch::Receiver<ConnectionStatus>,
}

impl ChatHub {
    /// Single-instance hub without Redis fan-out
    pub fn local(capacity: usize) -> Self {
        let (_tx, rx) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            capacity: capacity.max(1),
            rooms: RwLock::new(HashMap::new()),
            publisher: None,
            relay_status: rx,
        }
    }

    pub fn with_redis(
        capacity: usize,
        publisher: ConnectionManager,
        relay_status: watch::Receiver<ConnectionStatus>,
    ) -> Self {
        Self::with_publisher(capacity, Arc::new(publisher), relay_status)
    }

    pub fn with_publisher(
        capacity: usize,
        publisher: Arc<dyn Publisher>,
        relay_status: watch::Receiver<ConnectionStatus>,
    ) -> Self {
        Self {
            capacity: capacity.max(1),
            rooms: RwLock::new(HashMap::new()),
            publisher: Some(publisher),
            relay_status,
        }
    }

    /// Whether events go through Redis at all (false for a local hub)
    pub fn is_relayed(&self) -> bool {
        self.publisher.is_some()
    }

    pub fn relay_status(&self) -> ConnectionStatus {
        *self.relay_status.borrow()
    }

    pub fn subscribe(&self, room: Uuid) -> broadcast::Receiver<ChatEvent> {
        if let Some(tx) = self.read_rooms().get(&room) {
            return tx.subscribe();
        }
        let mut rooms = self.write_rooms();
        rooms
            .entry(room)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Hand an event to this instance's subscribers. Rooms with nobody
    /// listening are dropped. Returns the number of receivers reached.
    pub fn deliver_local(&self, event: ChatEvent) -> usize {
        let room = event.room();
        let closing = matches!(event, ChatEvent::RoomClosed { .. });
        let mut rooms = self.write_rooms();
        let delivered = rooms
            .get(&room)
            .map(|tx| tx.send(event).unwrap_or(0))
            .unwrap_or(0);
        if delivered == 0 || closing {
            rooms.remove(&room);
        }
        delivered
    }

    /// Publish through Redis when the relay is connected, locally otherwise
    pub async fn publish(&self, event: ChatEvent) {
        let relayed = self.relay_status.borrow().is_connected();
        if relayed {
            if let Some(publisher) = &self.publisher {
                match serde_json::to_string(&event) {
                    Ok(payload) => {
                        let channel = channel_name(event.room());
                        match publisher.send(&channel, payload).await {
                            Ok(_) => return,
                            Err(e) => {
                                tracing::warn!(channel = %channel, error = %e, "Chat publish failed, delivering locally");
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to encode chat event");
                    }
                }
            }
        }
        self.deliver_local(event);
    }

    pub async fn close_room(&self, room: Uuid) {
        self.publish(ChatEvent::RoomClosed { file_id: room }).await;
    }

    /// Ask every local subscriber to refetch state. Used after the relay
    /// reconnects, since events published during the outage were missed.
    pub fn resync_all(&self) -> usize {
        let rooms: Vec<Uuid> = self.read_rooms().keys().copied().collect();
        rooms
            .into_iter()
            .filter(|room| self.deliver_local(ChatEvent::Resync { file_id: *room }) > 0)
            .count()
    }

    pub fn room_count(&self) -> usize {
        self.read_rooms().len()
    }

    fn read_rooms(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, broadcast::Sender<ChatEvent>>> {
        self.rooms.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_rooms(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, broadcast::Sender<ChatEvent>>> {
        self.rooms.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_round_trip() {
        let id = Uuid::new_v4();
        assert_eq!(room_from_channel(&channel_name(id)), Some(id));
        assert_eq!(room_from_channel("clovadrop:other:x"), None);
        assert_eq!(room_from_channel("clovadrop:chat:not-a-uuid"), None);
    }

    #[tokio::test]
    async fn local_publish_reaches_room_subscribers_only() {
        let hub = ChatHub::local(16);
        let room = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut rx = hub.subscribe(room);
        let mut other_rx = hub.subscribe(other);

        hub.publish(ChatEvent::Resync { file_id: room }).await;
        assert_eq!(rx.recv().await.unwrap(), ChatEvent::Resync { file_id: room });
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rooms_are_dropped_when_nobody_listens() {
        let hub = ChatHub::local(16);
        let room = Uuid::new_v4();
        let rx = hub.subscribe(room);
        assert_eq!(hub.room_count(), 1);
        drop(rx);

        assert_eq!(hub.deliver_local(ChatEvent::Resync { file_id: room }), 0);
        assert_eq!(hub.room_count(), 0);

        // resubscribing creates a fresh channel
        let mut rx = hub.subscribe(room);
        hub.publish(ChatEvent::Resync { file_id: room }).await;
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn close_room_notifies_and_forgets() {
        let hub = ChatHub::local(16);
        let room = Uuid::new_v4();
        let mut rx = hub.subscribe(room);

        hub.close_room(room).await;
        assert_eq!(rx.recv().await.unwrap(), ChatEvent::RoomClosed { file_id: room });
        assert_eq!(hub.room_count(), 0);
        assert!(rx.recv().await.is_err());
    }

    #[tokio::test]
    async fn resync_all_reaches_every_live_room() {
        let hub = ChatHub::local(16);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut rx_a = hub.subscribe(a);
        let rx_b = hub.subscribe(b);
        drop(rx_b);

        assert_eq!(hub.resync_all(), 1);
        assert_eq!(rx_a.recv().await.unwrap(), ChatEvent::Resync { file_id: a });
        assert_eq!(hub.room_count(), 1);
    }

    /// Records what would go to Redis, optionally failing every publish
    #[derive(Default)]
    struct RecordingPublisher {
        sent: std::sync::Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn send(&self, channel: &str, payload: String) -> Result<(), redis::RedisError> {
            if self.fail {
                return Err(redis::RedisError::from((redis::ErrorKind::IoError, "connection refused")));
            }
            self.sent.lock().unwrap().push((channel.to_string(), payload));
            Ok(())
        }
    }

    #[tokio::test]
    async fn relayed_events_reach_local_subscribers_once() {
        let (_status_tx, status_rx) = watch::channel(ConnectionStatus::Connected);
        let publisher = Arc::new(RecordingPublisher::default());
        let hub = ChatHub::with_publisher(16, publisher.clone(), status_rx);
        assert!(hub.is_relayed());

        let room = Uuid::new_v4();
        let mut rx = hub.subscribe(room);
        hub.publish(ChatEvent::Resync { file_id: room }).await;

        // nothing local until the relay feeds the event back
        assert!(rx.try_recv().is_err());
        let sent = publisher.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, channel_name(room));

        let (channel, payload) = &sent[0];
        assert!(crate::relay::deliver_relayed(&hub, channel, payload));
        assert_eq!(rx.recv().await.unwrap(), ChatEvent::Resync { file_id: room });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_relay_publish_falls_back_to_local_once() {
        let (_status_tx, status_rx) = watch::channel(ConnectionStatus::Connected);
        let publisher = Arc::new(RecordingPublisher {
            fail: true,
            ..RecordingPublisher::default()
        });
        let hub = ChatHub::with_publisher(16, publisher, status_rx);

        let room = Uuid::new_v4();
        let mut rx = hub.subscribe(room);
        hub.publish(ChatEvent::Resync { file_id: room }).await;
        assert_eq!(rx.recv().await.unwrap(), ChatEvent::Resync { file_id: room });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reconnecting_relay_delivers_locally() {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connected);
        let publisher = Arc::new(RecordingPublisher::default());
        let hub = ChatHub::with_publisher(16, publisher.clone(), status_rx);
        status_tx.send(ConnectionStatus::Reconnecting { attempt: 1 }).unwrap();

        let room = Uuid::new_v4();
        let mut rx = hub.subscribe(room);
        hub.publish(ChatEvent::Resync { file_id: room }).await;
        assert_eq!(rx.recv().await.unwrap(), ChatEvent::Resync { file_id: room });
        assert!(publisher.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn local_hub_reports_disconnected_relay() {
        assert_eq!(ChatHub::local(4).relay_status(), ConnectionStatus::Disconnected);
    }
}
