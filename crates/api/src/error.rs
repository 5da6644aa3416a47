//! HTTP error responses for the file and chat routes

use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use clovadrop_chat::ChatError;
use clovadrop_core::virus_scan::ScanError;
use clovadrop_core::CoreError;
use clovadrop_storage::StorageError;
use serde_json::json;

use crate::archive::ArchiveError;

/// A status plus a message safe to show the client
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "Not found")
    }

    pub fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<StatusCode> for ApiError {
    fn from(status: StatusCode) -> Self {
        let message = status.canonical_reason().unwrap_or("Error");
        Self::new(status, message)
    }
}

fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        if e.is_user_error() {
            Self::new(status(e.status_code()), e.to_string())
        } else {
            tracing::error!("Request failed: {}", e);
            Self::internal()
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        let code = status(e.status_code());
        if code.is_server_error() {
            tracing::error!("Chat request failed: {}", e);
            Self::internal()
        } else {
            Self::new(code, e.to_string())
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        if e.is_not_found() {
            tracing::error!("Stored object missing: {}", e);
            Self::new(StatusCode::NOT_FOUND, "File content is no longer available")
        } else {
            tracing::error!("Storage failure: {}", e);
            Self::internal()
        }
    }
}

impl From<ScanError> for ApiError {
    fn from(e: ScanError) -> Self {
        tracing::error!(target: "virus_scan", "Virus scan unavailable: {}", e);
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Virus scanning is unavailable, try again later",
        )
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        tracing::warn!("Malformed multipart request: {}", e);
        Self::new(e.status(), e.body_text())
    }
}

impl From<ArchiveError> for ApiError {
    fn from(e: ArchiveError) -> Self {
        let code = status(e.status_code());
        if code.is_server_error() {
            tracing::error!("Archive operation failed: {}", e);
            Self::internal()
        } else {
            Self::new(code, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_errors_keep_their_message() {
        let err = ApiError::from(CoreError::Expired);
        assert_eq!(err.status, StatusCode::GONE);

        let err = ApiError::from(CoreError::Validation("bad expiry".into()));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.message.contains("bad expiry"));
    }

    #[test]
    fn internal_errors_are_masked() {
        let err = ApiError::from(CoreError::Config("secret detail".into()));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.message.contains("secret"));

        let err = ApiError::from(ChatError::NotAuthor);
        assert_eq!(err.status, StatusCode::FORBIDDEN);
    }

    #[test]
    fn archive_errors_map_to_conflict_and_not_found() {
        assert_eq!(ApiError::from(ArchiveError::LastEntry).status, StatusCode::CONFLICT);
        let missing = ApiError::from(ArchiveError::EntryNotFound("a.txt".into()));
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
        assert!(missing.message.contains("a.txt"));
    }

    #[test]
    fn scanner_outage_is_503() {
        let err = ApiError::from(ScanError::Unavailable("down".into()));
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
