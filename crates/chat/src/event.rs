//! Chat records and the events that flow through the realtime channel

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::ChatError;

pub const MAX_DISPLAY_NAME_CHARS: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ChatMessage {
    pub id: Uuid,
    pub file_id: Uuid,
    pub participant_id: Uuid,
    pub author_name: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Participant {
    pub id: Uuid,
    pub file_id: Uuid,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// A participant as shown to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ParticipantView {
    pub id: Uuid,
    pub display_name: String,
    pub online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    MessageCreated { message: ChatMessage },
    MessageDeleted { file_id: Uuid, message_id: Uuid },
    /// Debounced list of participants currently online
    Presence { file_id: Uuid, online: Vec<ParticipantView> },
    /// Local subscribers may have missed events and should refetch
    Resync { file_id: Uuid },
    /// The file (and its room) is gone
    RoomClosed { file_id: Uuid },
}

impl ChatEvent {
    pub fn room(&self) -> Uuid {
        match self {
            ChatEvent::MessageCreated { message } => message.file_id,
            ChatEvent::MessageDeleted { file_id, .. }
            | ChatEvent::Presence { file_id, .. }
            | ChatEvent::Resync { file_id }
            | ChatEvent::RoomClosed { file_id } => *file_id,
        }
    }
}

/// Full room state fetched from the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub file_id: Uuid,
    pub messages: Vec<ChatMessage>,
    pub participants: Vec<ParticipantView>,
}

/// Frames the server sends over the WebSocket
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Snapshot { snapshot: RoomSnapshot },
    Event { event: ChatEvent },
    Joined { participant: ParticipantView },
    Error { message: String },
}

/// Frames clients send over the WebSocket
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Message { participant_id: Uuid, body: String },
    Heartbeat { participant_id: Uuid, display_name: String },
    Leave { participant_id: Uuid },
}

/// Trim and length-check a message body
pub fn normalize_body(body: &str, max_chars: usize) -> Result<String, ChatError> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(ChatError::EmptyMessage);
    }
    if trimmed.chars().count() > max_chars {
        return Err(ChatError::MessageTooLong(max_chars));
    }
    Ok(trimmed.to_string())
}

pub fn normalize_display_name(name: &str) -> Result<String, ChatError> {
    let cleaned: String = name.chars().filter(|c| !c.is_control()).collect();
    let trimmed = cleaned.trim();
    let len = trimmed.chars().count();
    if len == 0 || len > MAX_DISPLAY_NAME_CHARS {
        return Err(ChatError::InvalidDisplayName(MAX_DISPLAY_NAME_CHARS));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wire_format_is_tagged() {
        let file_id = Uuid::new_v4();
        let message_id = Uuid::new_v4();
        let event = ChatEvent::MessageDeleted { file_id, message_id };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "message_deleted");
        assert_eq!(event.room(), file_id);

        let back: ChatEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn client_frames_parse() {
        let id = Uuid::new_v4();
        let raw = format!(r#"{{"type":"message","participant_id":"{}","body":"hi"}}"#, id);
        match serde_json::from_str::<ClientFrame>(&raw).unwrap() {
            ClientFrame::Message { participant_id, body } => {
                assert_eq!(participant_id, id);
                assert_eq!(body, "hi");
            }
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn body_and_name_normalization() {
        assert_eq!(normalize_body("  hello \n", 10).unwrap(), "hello");
        assert!(matches!(normalize_body("   ", 10), Err(ChatError::EmptyMessage)));
        assert!(matches!(normalize_body("ééééé", 4), Err(ChatError::MessageTooLong(4))));
        assert!(normalize_body("ééééé", 5).is_ok());

        assert_eq!(normalize_display_name(" Ada\u{7} ").unwrap(), "Ada");
        assert!(normalize_display_name("").is_err());
        assert!(normalize_display_name(&"a".repeat(41)).is_err());
    }
}
