//! Per-file chat: HTTP routes and the realtime WebSocket

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use clovadrop_chat::event::{normalize_body, normalize_display_name};
use clovadrop_chat::store::{self, clamp_limit, DEFAULT_HISTORY_LIMIT};
use clovadrop_chat::timeline::TIMELINE_CAPACITY;
use clovadrop_chat::{ChatError, ChatEvent, ClientFrame, ParticipantView, ServerFrame, Timeline};
use clovadrop_core::config::env_or;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::handlers::{ensure_available, resolve_share};
use crate::AppState;

pub const DEFAULT_MAX_MESSAGE_LEN: usize = 2000;
const PING_INTERVAL: Duration = Duration::from_secs(20);
const MAX_FRAME_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub max_message_len: usize,
    pub history_limit: i64,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl ChatSettings {
    pub fn from_env() -> Self {
        Self {
            max_message_len: env_or("CHAT_MAX_MESSAGE_LEN", DEFAULT_MAX_MESSAGE_LEN).max(1),
            history_limit: clamp_limit(Some(env_or("CHAT_HISTORY_LIMIT", DEFAULT_HISTORY_LIMIT))),
        }
    }
}

/// The chat room behind a download token
async fn room_for(state: &AppState, token: &str) -> ApiResult<Uuid> {
    let file = resolve_share(state, token).await?;
    ensure_available(&file)?;
    Ok(file.id)
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub after: Option<Uuid>,
    pub limit: Option<i64>,
}

/// GET /api/chat/{token}/messages
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Value>> {
    let room = room_for(&state, &token).await?;
    let limit = query.limit.map(|l| clamp_limit(Some(l))).unwrap_or(state.chat.history_limit);
    let messages = store::list_messages(&state.pool, room, query.after, limit).await?;
    Ok(Json(json!({ "messages": messages })))
}

#[derive(Debug, Deserialize)]
pub struct NewMessage {
    pub participant_id: Uuid,
    pub body: String,
}

/// POST /api/chat/{token}/messages
pub async fn post_message(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Json(input): Json<NewMessage>,
) -> ApiResult<impl IntoResponse> {
    let room = room_for(&state, &token).await?;
    let body = normalize_body(&input.body, state.chat.max_message_len)?;
    let message = store::insert_message(&state.pool, room, input.participant_id, &body).await?;

    state
        .hub
        .publish(ChatEvent::MessageCreated {
            message: message.clone(),
        })
        .await;

    Ok((StatusCode::CREATED, Json(message)))
}

#[derive(Debug, Deserialize)]
pub struct AuthorQuery {
    pub participant_id: Uuid,
}

/// DELETE /api/chat/{token}/messages/{id}
pub async fn delete_message(
    State(state): State<Arc<AppState>>,
    Path((token, message_id)): Path<(String, Uuid)>,
    Query(author): Query<AuthorQuery>,
) -> ApiResult<StatusCode> {
    let room = room_for(&state, &token).await?;
    store::delete_message(&state.pool, room, message_id, author.participant_id).await?;
    state
        .hub
        .publish(ChatEvent::MessageDeleted {
            file_id: room,
            message_id,
        })
        .await;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/chat/{token}/participants
pub async fn list_participants(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> ApiResult<Json<Value>> {
    let room = room_for(&state, &token).await?;
    let participants = store::list_participants(&state.pool, room, state.presence.timeout()).await?;
    let online = participants.iter().filter(|p| p.online).count();
    Ok(Json(json!({ "participants": participants, "online": online })))
}

#[derive(Debug, Deserialize)]
pub struct Heartbeat {
    pub participant_id: Option<Uuid>,
    pub display_name: String,
}

/// Join or keep a participant alive, in Postgres and the local tracker
async fn touch_participant(
    state: &AppState,
    room: Uuid,
    participant_id: Uuid,
    display_name: &str,
) -> Result<ParticipantView, ChatError> {
    let name = normalize_display_name(display_name)?;
    let participant = store::upsert_participant(&state.pool, room, participant_id, &name).await?;
    state.presence.heartbeat(room, participant.id, &participant.display_name);
    Ok(ParticipantView {
        id: participant.id,
        display_name: participant.display_name,
        online: true,
    })
}

async fn leave_room(state: &AppState, room: Uuid, participant_id: Uuid) -> Result<(), ChatError> {
    store::mark_left(&state.pool, room, participant_id).await?;
    state.presence.leave(room, participant_id);
    Ok(())
}

/// POST /api/chat/{token}/presence
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Json(input): Json<Heartbeat>,
) -> ApiResult<Json<Value>> {
    let room = room_for(&state, &token).await?;
    let participant_id = input.participant_id.unwrap_or_else(Uuid::new_v4);
    let participant = touch_participant(&state, room, participant_id, &input.display_name).await?;
    Ok(Json(json!({
        "participant": participant,
        "timeout_secs": state.presence.timeout().as_secs(),
    })))
}

/// DELETE /api/chat/{token}/presence/{participant_id}
pub async fn leave(
    State(state): State<Arc<AppState>>,
    Path((token, participant_id)): Path<(String, Uuid)>,
) -> ApiResult<StatusCode> {
    let room = room_for(&state, &token).await?;
    leave_room(&state, room, participant_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/chat/{token}/ws
pub async fn websocket(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let room = room_for(&state, &token).await?;
    Ok(ws
        .max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| run_socket(socket, state, room)))
}

/// Whether a live event still needs to go to a client whose view is
/// `timeline`. Message events already reflected there are dropped.
/// Deletions pass once per id, including ids older than the snapshot.
pub fn should_forward(timeline: &mut Timeline, event: &ChatEvent) -> bool {
    match event {
        ChatEvent::MessageCreated { .. } => timeline.apply(event),
        ChatEvent::MessageDeleted { message_id, .. } => {
            let first = !timeline.is_deleted(message_id);
            timeline.apply(event);
            first
        }
        ChatEvent::Presence { .. } | ChatEvent::RoomClosed { .. } => true,
        ChatEvent::Resync { .. } => false,
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), axum::Error> {
    match serde_json::to_string(frame) {
        Ok(text) => socket.send(Message::Text(text.into())).await,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode chat frame");
            Ok(())
        }
    }
}

async fn send_snapshot(
    socket: &mut WebSocket,
    state: &AppState,
    room: Uuid,
    timeline: &mut Timeline,
) -> Result<(), axum::Error> {
    match store::snapshot(&state.pool, room, state.chat.history_limit, state.presence.timeout()).await {
        Ok(snapshot) => {
            timeline.merge_snapshot(snapshot.messages.iter().cloned());
            send_frame(socket, &ServerFrame::Snapshot { snapshot }).await
        }
        Err(e) => {
            tracing::error!(file_id = %room, error = %e, "Failed to load chat snapshot");
            send_frame(
                socket,
                &ServerFrame::Error {
                    message: "Chat history is temporarily unavailable".to_string(),
                },
            )
            .await
        }
    }
}

fn client_error(e: &ChatError) -> ServerFrame {
    let message = if e.status_code() >= 500 {
        tracing::error!(error = %e, "Chat frame failed");
        "Something went wrong, try again".to_string()
    } else {
        e.to_string()
    };
    ServerFrame::Error { message }
}

/// The participant a socket stops speaking for when it heartbeats as `next`
fn superseded(joined: Option<Uuid>, next: Uuid) -> Option<Uuid> {
    joined.filter(|current| *current != next)
}

/// Handle one client frame. Returns the participant this socket speaks
/// for after the frame.
async fn handle_client_frame(
    socket: &mut WebSocket,
    state: &AppState,
    room: Uuid,
    joined: Option<Uuid>,
    frame: ClientFrame,
) -> Result<Option<Uuid>, axum::Error> {
    match frame {
        ClientFrame::Message { participant_id, body } => {
            let result = match normalize_body(&body, state.chat.max_message_len) {
                Ok(body) => store::insert_message(&state.pool, room, participant_id, &body).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(message) => state.hub.publish(ChatEvent::MessageCreated { message }).await,
                Err(e) => send_frame(socket, &client_error(&e)).await?,
            }
            Ok(joined)
        }
        ClientFrame::Heartbeat {
            participant_id,
            display_name,
        } => match touch_participant(state, room, participant_id, &display_name).await {
            Ok(participant) => {
                if let Some(previous) = superseded(joined, participant.id) {
                    if let Err(e) = leave_room(state, room, previous).await {
                        tracing::warn!(file_id = %room, participant_id = %previous, error = %e, "Failed to retire replaced participant");
                    }
                }
                if joined != Some(participant.id) {
                    send_frame(socket, &ServerFrame::Joined { participant }).await?;
                }
                Ok(Some(participant_id))
            }
            Err(e) => {
                send_frame(socket, &client_error(&e)).await?;
                Ok(joined)
            }
        },
        ClientFrame::Leave { participant_id } => {
            if let Err(e) = leave_room(state, room, participant_id).await {
                send_frame(socket, &client_error(&e)).await?;
                return Ok(joined);
            }
            Ok(joined.filter(|id| *id != participant_id))
        }
    }
}

async fn run_socket(mut socket: WebSocket, state: Arc<AppState>, room: Uuid) {
    // Subscribe first so nothing published while the snapshot loads is lost
    let mut events = state.hub.subscribe(room);
    let mut timeline = Timeline::with_capacity(TIMELINE_CAPACITY);
    if send_snapshot(&mut socket, &state, room, &mut timeline).await.is_err() {
        return;
    }

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;
    let mut joined: Option<Uuid> = None;

    tracing::debug!(file_id = %room, "Chat socket opened");

    loop {
        tokio::select! {
            event = events.recv() => {
                let sent = match event {
                    Ok(ChatEvent::Resync { .. }) => {
                        send_snapshot(&mut socket, &state, room, &mut timeline).await
                    }
                    Ok(event @ ChatEvent::RoomClosed { .. }) => {
                        let _ = send_frame(&mut socket, &ServerFrame::Event { event }).await;
                        let _ = socket
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code::AWAY,
                                reason: "Share removed".into(),
                            })))
                            .await;
                        break;
                    }
                    Ok(event) => {
                        if should_forward(&mut timeline, &event) {
                            send_frame(&mut socket, &ServerFrame::Event { event }).await
                        } else {
                            Ok(())
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(file_id = %room, missed = missed, "Chat socket lagged, resending snapshot");
                        send_snapshot(&mut socket, &state, room, &mut timeline).await
                    }
                    Err(RecvError::Closed) => break,
                };
                if sent.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let frame = match serde_json::from_str::<ClientFrame>(text.as_str()) {
                            Ok(frame) => frame,
                            Err(e) => {
                                let error = ServerFrame::Error { message: format!("Invalid frame: {}", e) };
                                if send_frame(&mut socket, &error).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                        };
                        match handle_client_frame(&mut socket, &state, room, joined, frame).await {
                            Ok(now_joined) => joined = now_joined,
                            Err(_) => break,
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(file_id = %room, error = %e, "Chat socket error");
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                if socket.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(participant_id) = joined {
        if let Err(e) = leave_room(&state, room, participant_id).await {
            tracing::warn!(file_id = %room, error = %e, "Failed to mark participant as left");
        }
    }
    tracing::debug!(file_id = %room, "Chat socket closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use clovadrop_chat::ChatMessage;

    fn message(room: Uuid) -> ChatMessage {
        ChatMessage {
            id: Uuid::new_v4(),
            file_id: room,
            participant_id: Uuid::new_v4(),
            author_name: "ada".to_string(),
            body: "hi".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn events_in_the_snapshot_are_not_forwarded() {
        let room = Uuid::new_v4();
        let seen = message(room);
        let mut timeline = Timeline::with_capacity(10);
        timeline.merge_snapshot(vec![seen.clone()]);

        let duplicate = ChatEvent::MessageCreated { message: seen.clone() };
        assert!(!should_forward(&mut timeline, &duplicate));

        let fresh = ChatEvent::MessageCreated { message: message(room) };
        assert!(should_forward(&mut timeline, &fresh));

        let deleted = ChatEvent::MessageDeleted { file_id: room, message_id: seen.id };
        assert!(should_forward(&mut timeline, &deleted));
        assert!(!should_forward(&mut timeline, &deleted));
        // a late create for a deleted message stays hidden
        assert!(!should_forward(&mut timeline, &duplicate));
    }

    #[test]
    fn deleting_older_history_reaches_the_client() {
        let room = Uuid::new_v4();
        let mut timeline = Timeline::with_capacity(10);
        timeline.merge_snapshot(vec![message(room)]);

        let older = message(room);
        let deleted = ChatEvent::MessageDeleted { file_id: room, message_id: older.id };
        assert!(should_forward(&mut timeline, &deleted));
        assert!(!should_forward(&mut timeline, &deleted));
        assert!(!should_forward(&mut timeline, &ChatEvent::MessageCreated { message: older }));
        assert_eq!(timeline.len(), 1);
    }

    #[test]
    fn switching_identity_retires_the_previous_participant() {
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        assert_eq!(superseded(None, first), None);
        assert_eq!(superseded(Some(first), first), None);
        assert_eq!(superseded(Some(first), second), Some(first));
    }

    #[test]
    fn presence_and_close_always_pass() {
        let room = Uuid::new_v4();
        let mut timeline = Timeline::with_capacity(10);
        assert!(should_forward(&mut timeline, &ChatEvent::Presence { file_id: room, online: vec![] }));
        assert!(should_forward(&mut timeline, &ChatEvent::RoomClosed { file_id: room }));
        assert!(!should_forward(&mut timeline, &ChatEvent::Resync { file_id: room }));
    }

    #[test]
    fn server_errors_are_masked_for_clients() {
        match client_error(&ChatError::NotJoined) {
            ServerFrame::Error { message } => assert!(message.contains("Join")),
            other => panic!("unexpected frame {:?}", other),
        }
        match client_error(&ChatError::Database(sqlx::Error::PoolTimedOut)) {
            ServerFrame::Error { message } => assert!(!message.contains("pool")),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn default_settings() {
        let settings = ChatSettings::default();
        assert_eq!(settings.max_message_len, 2000);
        assert_eq!(settings.history_limit, DEFAULT_HISTORY_LIMIT);
    }
}
