//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File not found")]
    NotFound,

    #[error("This link has expired")]
    Expired,

    #[error("Download limit reached")]
    DownloadLimitReached,

    #[error("Password required")]
    PasswordRequired,

    #[error("Incorrect password")]
    WrongPassword,

    #[error("{0}")]
    Validation(String),

    #[error("File type .{0} is not allowed")]
    BlockedExtension(String),

    #[error("File exceeds the maximum upload size of {0} bytes")]
    TooLarge(u64),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("Password hashing failed")]
    Hashing,
}

impl CoreError {
    /// Errors caused by the caller, logged at warn rather than error
    pub fn is_user_error(&self) -> bool {
        !matches!(
            self,
            CoreError::Config(_) | CoreError::Database(_) | CoreError::Cache(_) | CoreError::Hashing
        )
    }

    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::NotFound => 404,
            CoreError::Expired | CoreError::DownloadLimitReached => 410,
            CoreError::PasswordRequired | CoreError::WrongPassword => 401,
            CoreError::Validation(_) | CoreError::BlockedExtension(_) => 400,
            CoreError::TooLarge(_) => 413,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(CoreError::Expired.status_code(), 410);
        assert_eq!(CoreError::DownloadLimitReached.status_code(), 410);
        assert_eq!(CoreError::WrongPassword.status_code(), 401);
        assert_eq!(CoreError::TooLarge(10).status_code(), 413);
        assert_eq!(CoreError::Hashing.status_code(), 500);
        assert!(!CoreError::Hashing.is_user_error());
        assert!(CoreError::BlockedExtension("exe".into()).is_user_error());
    }
}
