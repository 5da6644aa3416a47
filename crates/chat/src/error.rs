use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Message is empty")]
    EmptyMessage,

    #[error("Message is longer than {0} characters")]
    MessageTooLong(usize),

    #[error("Display name must be between 1 and {0} characters")]
    InvalidDisplayName(usize),

    #[error("Join the room before sending messages")]
    NotJoined,

    #[error("Only the author can delete this message")]
    NotAuthor,

    #[error("Participant belongs to another room")]
    ParticipantConflict,

    #[error("Message not found")]
    NotFound,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Malformed event: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ChatError {
    pub fn status_code(&self) -> u16 {
        match self {
            ChatError::EmptyMessage
            | ChatError::MessageTooLong(_)
            | ChatError::InvalidDisplayName(_)
            | ChatError::Serialization(_) => 400,
            ChatError::NotJoined | ChatError::NotAuthor => 403,
            ChatError::ParticipantConflict => 409,
            ChatError::NotFound => 404,
            ChatError::Database(_) | ChatError::Redis(_) => 500,
        }
    }
}
