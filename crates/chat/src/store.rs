//! Postgres persistence for chat messages and participants

use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use crate::error::ChatError;
use crate::event::{ChatMessage, Participant, ParticipantView, RoomSnapshot};

pub const DEFAULT_HISTORY_LIMIT: i64 = 100;
pub const MAX_HISTORY_LIMIT: i64 = 500;

const MESSAGE_COLUMNS: &str = "id, file_id, participant_id, author_name, body, created_at";

pub fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT)
}

/// Messages in `(created_at, id)` order. With a cursor, the messages after
/// it; without one (or when the cursor message is gone), the newest `limit`.
pub async fn list_messages(
    pool: &PgPool,
    file_id: Uuid,
    after: Option<Uuid>,
    limit: i64,
) -> Result<Vec<ChatMessage>, ChatError> {
    if let Some(cursor) = after {
        let anchor: Option<(chrono::DateTime<chrono::Utc>, Uuid)> = sqlx::query_as(
            "SELECT created_at, id FROM chat_messages WHERE id = $1 AND file_id = $2",
        )
        .bind(cursor)
        .bind(file_id)
        .fetch_optional(pool)
        .await?;

        if let Some((created_at, id)) = anchor {
            let messages = sqlx::query_as::<_, ChatMessage>(&format!(
                r#"
                SELECT {MESSAGE_COLUMNS}
                FROM chat_messages
                WHERE file_id = $1 AND (created_at, id) > ($2, $3)
                ORDER BY created_at ASC, id ASC
                LIMIT $4
                "#
            ))
            .bind(file_id)
            .bind(created_at)
            .bind(id)
            .bind(limit)
            .fetch_all(pool)
            .await?;
            return Ok(messages);
        }
        tracing::debug!(file_id = %file_id, cursor = %cursor, "Chat cursor not found, returning latest");
    }

    let messages = sqlx::query_as::<_, ChatMessage>(&format!(
        r#"
        SELECT {MESSAGE_COLUMNS} FROM (
            SELECT {MESSAGE_COLUMNS}
            FROM chat_messages
            WHERE file_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
        ) recent
        ORDER BY created_at ASC, id ASC
        "#
    ))
    .bind(file_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(messages)
}

/// Only participants of the room who have not left may post
fn insert_message_sql() -> String {
    format!(
        r#"
        INSERT INTO chat_messages (id, file_id, participant_id, author_name, body)
        SELECT $1, p.file_id, p.id, p.display_name, $4
        FROM chat_participants p
        WHERE p.id = $3 AND p.file_id = $2 AND p.left_at IS NULL
        RETURNING {MESSAGE_COLUMNS}
        "#
    )
}

/// Insert a message authored by a participant of this room. The author's
/// current display name is copied onto the message.
pub async fn insert_message(
    pool: &PgPool,
    file_id: Uuid,
    participant_id: Uuid,
    body: &str,
) -> Result<ChatMessage, ChatError> {
    let message = sqlx::query_as::<_, ChatMessage>(&insert_message_sql())
    .bind(Uuid::new_v4())
    .bind(file_id)
    .bind(participant_id)
    .bind(body)
    .fetch_optional(pool)
    .await?;

    message.ok_or(ChatError::NotJoined)
}

pub async fn delete_message(
    pool: &PgPool,
    file_id: Uuid,
    message_id: Uuid,
    participant_id: Uuid,
) -> Result<(), ChatError> {
    let author: Option<Uuid> = sqlx::query_scalar(
        "SELECT participant_id FROM chat_messages WHERE id = $1 AND file_id = $2",
    )
    .bind(message_id)
    .bind(file_id)
    .fetch_optional(pool)
    .await?;

    match author {
        None => Err(ChatError::NotFound),
        Some(author) if author != participant_id => Err(ChatError::NotAuthor),
        Some(_) => {
            let result = sqlx::query(
                "DELETE FROM chat_messages WHERE id = $1 AND file_id = $2 AND participant_id = $3",
            )
            .bind(message_id)
            .bind(file_id)
            .bind(participant_id)
            .execute(pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(ChatError::NotFound);
            }
            Ok(())
        }
    }
}

/// Join or heartbeat. Renames are applied; an id owned by another room
/// is rejected.
pub async fn upsert_participant(
    pool: &PgPool,
    file_id: Uuid,
    participant_id: Uuid,
    display_name: &str,
) -> Result<Participant, ChatError> {
    let participant = sqlx::query_as::<_, Participant>(
        r#"
        INSERT INTO chat_participants (id, file_id, display_name)
        VALUES ($1, $2, $3)
        ON CONFLICT (id) DO UPDATE
            SET display_name = EXCLUDED.display_name,
                last_seen_at = NOW(),
                left_at = NULL
            WHERE chat_participants.file_id = EXCLUDED.file_id
        RETURNING id, file_id, display_name, joined_at, last_seen_at
        "#,
    )
    .bind(participant_id)
    .bind(file_id)
    .bind(display_name)
    .fetch_optional(pool)
    .await?;

    participant.ok_or(ChatError::ParticipantConflict)
}

pub async fn mark_left(pool: &PgPool, file_id: Uuid, participant_id: Uuid) -> Result<bool, ChatError> {
    let result = sqlx::query(
        "UPDATE chat_participants SET left_at = NOW() WHERE id = $1 AND file_id = $2 AND left_at IS NULL",
    )
    .bind(participant_id)
    .bind(file_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Everyone who ever joined, flagged online when their last heartbeat is
/// within `timeout` and they have not left
pub async fn list_participants(
    pool: &PgPool,
    file_id: Uuid,
    timeout: Duration,
) -> Result<Vec<ParticipantView>, ChatError> {
    let participants = sqlx::query_as::<_, ParticipantView>(
        r#"
        SELECT id, display_name,
               (left_at IS NULL AND last_seen_at > NOW() - make_interval(secs => $2)) AS online
        FROM chat_participants
        WHERE file_id = $1
        ORDER BY display_name ASC, id ASC
        "#,
    )
    .bind(file_id)
    .bind(timeout.as_secs_f64())
    .fetch_all(pool)
    .await?;

    Ok(participants)
}

pub async fn snapshot(
    pool: &PgPool,
    file_id: Uuid,
    limit: i64,
    presence_timeout: Duration,
) -> Result<RoomSnapshot, ChatError> {
    let messages = list_messages(pool, file_id, None, limit).await?;
    let participants = list_participants(pool, file_id, presence_timeout).await?;
    Ok(RoomSnapshot {
        file_id,
        messages,
        participants,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_limit_is_clamped() {
        assert_eq!(clamp_limit(None), DEFAULT_HISTORY_LIMIT);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(-5)), 1);
        assert_eq!(clamp_limit(Some(10_000)), MAX_HISTORY_LIMIT);
        assert_eq!(clamp_limit(Some(42)), 42);
    }

    #[test]
    fn participants_who_left_cannot_post() {
        let sql = insert_message_sql();
        let filter = sql.split("WHERE").nth(1).unwrap();
        assert!(filter.contains("p.left_at IS NULL"));
        assert!(filter.contains("p.file_id = $2"));
    }
}
