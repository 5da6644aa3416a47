//! Redis pub/sub subscriber that feeds events from every instance into the
//! local hub, reconnecting with backoff.

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::connection::{ConnectionState, ConnectionStatus};
use crate::event::ChatEvent;
use crate::hub::{room_from_channel, ChatHub, CHANNEL_PATTERN};

pub struct RedisRelay {
    client: redis::Client,
    hub: Arc<ChatHub>,
    state: ConnectionState,
}

impl RedisRelay {
    pub fn new(client: redis::Client, hub: Arc<ChatHub>, state: ConnectionState) -> Self {
        Self { client, hub, state }
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.state.subscribe()
    }

    /// Run until the retry budget is exhausted
    pub async fn run(mut self) {
        loop {
            match self.client.get_async_pubsub().await {
                Ok(mut pubsub) => match pubsub.psubscribe(CHANNEL_PATTERN).await {
                    Ok(()) => {
                        let reconnected = self.state.on_connected();
                        tracing::info!(pattern = CHANNEL_PATTERN, "Chat relay subscribed");
                        if reconnected {
                            let rooms = self.hub.resync_all();
                            tracing::info!(rooms = rooms, "Chat relay reconnected, resyncing rooms");
                        }

                        let mut messages = pubsub.on_message();
                        while let Some(msg) = messages.next().await {
                            self.dispatch(&msg);
                        }
                        tracing::warn!("Chat relay stream ended");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Chat relay subscribe failed");
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "Chat relay connection failed");
                }
            }

            match self.state.on_disconnected() {
                Some(delay) => {
                    tracing::info!(
                        delay_ms = delay.as_millis() as u64,
                        status = self.state.status().label(),
                        "Chat relay retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    tracing::error!("Chat relay gave up reconnecting; events stay instance-local");
                    return;
                }
            }
        }
    }

    fn dispatch(&self, msg: &redis::Msg) {
        let channel = msg.get_channel_name();
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(channel = channel, error = %e, "Unreadable relay payload");
                return;
            }
        };
        deliver_relayed(&self.hub, channel, &payload);
    }
}

/// Feed one pub/sub message into the local hub. Returns false when the
/// channel or payload is not a chat event.
pub fn deliver_relayed(hub: &ChatHub, channel: &str, payload: &str) -> bool {
    let Some(room) = room_from_channel(channel) else {
        tracing::debug!(channel = channel, "Ignoring message on unknown channel");
        return false;
    };
    match decode_event(room, payload) {
        Some(event) => {
            hub.deliver_local(event);
            true
        }
        None => {
            tracing::warn!(channel = channel, "Dropping malformed relay event");
            false
        }
    }
}

/// Decode a relayed event, rejecting ones whose room disagrees with the channel
pub fn decode_event(room: uuid::Uuid, payload: &str) -> Option<ChatEvent> {
    serde_json::from_str::<ChatEvent>(payload)
        .ok()
        .filter(|event| event.room() == room)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn decode_checks_room() {
        let room = Uuid::new_v4();
        let payload = serde_json::to_string(&ChatEvent::Resync { file_id: room }).unwrap();
        assert_eq!(decode_event(room, &payload), Some(ChatEvent::Resync { file_id: room }));
        assert_eq!(decode_event(Uuid::new_v4(), &payload), None);
        assert_eq!(decode_event(room, "{not json"), None);
    }

    #[test]
    fn foreign_channels_are_ignored() {
        let hub = ChatHub::local(4);
        let room = Uuid::new_v4();
        let payload = serde_json::to_string(&ChatEvent::Resync { file_id: room }).unwrap();
        assert!(!deliver_relayed(&hub, "other:channel", &payload));
        assert!(!deliver_relayed(&hub, &crate::hub::channel_name(Uuid::new_v4()), &payload));
    }
}
