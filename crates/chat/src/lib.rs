//! Ephemeral per-file chat rooms: storage, presence and realtime fan-out.

pub mod backoff;
pub mod connection;
pub mod error;
pub mod event;
pub mod hub;
pub mod presence;
pub mod relay;
pub mod store;
pub mod timeline;

pub use backoff::Backoff;
pub use connection::{ConnectionState, ConnectionStatus};
pub use error::ChatError;
pub use event::{ChatEvent, ChatMessage, ClientFrame, ParticipantView, RoomSnapshot, ServerFrame};
pub use hub::ChatHub;
pub use presence::PresenceService;
pub use relay::RedisRelay;
pub use timeline::Timeline;

use std::sync::Arc;

/// Build the hub, connecting the Redis relay when a client is given.
/// The returned relay must be spawned by the caller.
pub async fn connect_hub(redis: Option<redis::Client>) -> (Arc<ChatHub>, Option<RedisRelay>) {
    let Some(client) = redis else {
        return (Arc::new(ChatHub::local(hub::ROOM_CAPACITY)), None);
    };

    match redis::aio::ConnectionManager::new(client.clone()).await {
        Ok(publisher) => {
            let state = ConnectionState::new(Backoff::default());
            let hub = Arc::new(ChatHub::with_redis(hub::ROOM_CAPACITY, publisher, state.subscribe()));
            let relay = RedisRelay::new(client, hub.clone(), state);
            (hub, Some(relay))
        }
        Err(e) => {
            tracing::warn!(error = %e, "Redis unavailable for chat fan-out, using local hub");
            (Arc::new(ChatHub::local(hub::ROOM_CAPACITY)), None)
        }
    }
}
