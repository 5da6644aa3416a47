use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct SharedFile {
    pub id: Uuid,
    pub ulid: String,
    pub name: String,
    pub storage_key: String,
    pub size_bytes: i64,
    pub content_type: String,
    pub content_hash: String,
    pub is_archive: bool,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub max_downloads: Option<i32>,
    pub download_count: i32,
    pub download_token: String,
    #[serde(skip_serializing)]
    pub edit_token_hash: String,
    #[serde(skip_serializing)]
    pub uploader_ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SharedFile {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.max_downloads, Some(max) if self.download_count >= max)
    }

    /// None when the file has no download limit
    pub fn downloads_remaining(&self) -> Option<i32> {
        self.max_downloads
            .map(|max| (max - self.download_count).max(0))
    }

    pub fn requires_password(&self) -> bool {
        self.password_hash.is_some()
    }

    /// Whether the file can still be served (not expired, not exhausted)
    pub fn is_available_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired_at(now) && !self.is_exhausted()
    }
}

/// Everything needed to insert a new shared file row
#[derive(Debug, Clone)]
pub struct NewSharedFile {
    pub ulid: String,
    pub name: String,
    pub storage_key: String,
    pub size_bytes: i64,
    pub content_type: String,
    pub content_hash: String,
    pub is_archive: bool,
    pub password_hash: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub max_downloads: Option<i32>,
    pub download_token: String,
    pub edit_token_hash: String,
    pub uploader_ip: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessAction {
    Upload,
    View,
    Download,
    DownloadDenied,
    SettingsUpdated,
    ArchiveEntryAdded,
    ArchiveEntryRemoved,
    Deleted,
}

impl AccessAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessAction::Upload => "upload",
            AccessAction::View => "view",
            AccessAction::Download => "download",
            AccessAction::DownloadDenied => "download_denied",
            AccessAction::SettingsUpdated => "settings_updated",
            AccessAction::ArchiveEntryAdded => "archive_entry_added",
            AccessAction::ArchiveEntryRemoved => "archive_entry_removed",
            AccessAction::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let action = match s {
            "upload" => AccessAction::Upload,
            "view" => AccessAction::View,
            "download" => AccessAction::Download,
            "download_denied" => AccessAction::DownloadDenied,
            "settings_updated" => AccessAction::SettingsUpdated,
            "archive_entry_added" => AccessAction::ArchiveEntryAdded,
            "archive_entry_removed" => AccessAction::ArchiveEntryRemoved,
            "deleted" => AccessAction::Deleted,
            _ => return None,
        };
        Some(action)
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AccessLogEntry {
    pub id: Uuid,
    pub file_id: Uuid,
    pub action: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Who performed a request, for access logging
#[derive(Debug, Clone, Default)]
pub struct RequestOrigin {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}
