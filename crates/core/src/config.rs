//! Environment-driven configuration.
//!
//! Everything is read once at startup. Unset or unparsable values fall back
//! to defaults with a log line, except `DATABASE_URL` which is required.

use std::str::FromStr;

use crate::error::CoreError;

/// Read `key` and parse it, falling back to `default` when unset or invalid
pub fn env_or<T: FromStr>(key: &str, default: T) -> T
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Invalid value for {}: {} (using default)", key, e);
                default
            }
        },
        Err(_) => default,
    }
}

pub fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

/// Comma-separated list, lowercased and trimmed, empties removed
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_start_matches('.').to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, CoreError> {
        let url = std::env::var("DATABASE_URL")
            .map_err(|_| CoreError::Config("DATABASE_URL must be set".to_string()))?;
        Ok(Self {
            url,
            max_connections: env_or("DB_MAX_CONNECTIONS", 20),
            min_connections: env_or("DB_MIN_CONNECTIONS", 2),
            acquire_timeout_secs: env_or("DB_ACQUIRE_TIMEOUT_SECS", 3),
            idle_timeout_secs: env_or("DB_IDLE_TIMEOUT_SECS", 600),
            max_lifetime_secs: env_or("DB_MAX_LIFETIME_SECS", 1800),
        })
    }
}

#[derive(Debug, Clone)]
pub enum StorageConfig {
    Local { path: String },
    S3 { bucket: String, endpoint: Option<String> },
}

impl StorageConfig {
    pub fn from_env() -> Self {
        let storage_type = std::env::var("STORAGE_TYPE").unwrap_or_else(|_| "local".to_string());
        if storage_type == "s3" {
            StorageConfig::S3 {
                bucket: std::env::var("S3_BUCKET").unwrap_or_else(|_| "clovadrop-files".to_string()),
                endpoint: std::env::var("S3_ENDPOINT").ok().filter(|s| !s.is_empty()),
            }
        } else {
            StorageConfig::Local {
                path: std::env::var("LOCAL_STORAGE_PATH").unwrap_or_else(|_| "uploads".to_string()),
            }
        }
    }
}

/// Limits applied to every upload and archive addition
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub max_upload_bytes: u64,
    pub blocked_extensions: Vec<String>,
    /// Empty means every content type is accepted
    pub allowed_content_types: Vec<String>,
    pub default_expiry_hours: i64,
    pub max_expiry_hours: i64,
    pub max_download_limit: i32,
}

pub const DEFAULT_BLOCKED_EXTENSIONS: &str = "exe,dll,bat,cmd,com,scr,msi,vbs,ps1,jar,apk";

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_upload_bytes: 100 * 1024 * 1024,
            blocked_extensions: parse_list(DEFAULT_BLOCKED_EXTENSIONS),
            allowed_content_types: Vec::new(),
            default_expiry_hours: 24,
            max_expiry_hours: 720,
            max_download_limit: 1000,
        }
    }
}

impl UploadPolicy {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let blocked = std::env::var("BLOCKED_EXTENSIONS")
            .unwrap_or_else(|_| DEFAULT_BLOCKED_EXTENSIONS.to_string());
        let allowed = std::env::var("ALLOWED_CONTENT_TYPES").unwrap_or_default();
        Self {
            max_upload_bytes: env_or("MAX_UPLOAD_BYTES", defaults.max_upload_bytes),
            blocked_extensions: parse_list(&blocked),
            allowed_content_types: parse_list(&allowed),
            default_expiry_hours: env_or("DEFAULT_EXPIRY_HOURS", defaults.default_expiry_hours),
            max_expiry_hours: env_or("MAX_EXPIRY_HOURS", defaults.max_expiry_hours).max(1),
            max_download_limit: env_or("MAX_DOWNLOAD_LIMIT", defaults.max_download_limit).max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub base_url: String,
    pub redis_url: String,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub upload: UploadPolicy,
    pub use_presigned_urls: bool,
    pub presigned_url_expiry: u64,
    pub cdn_domain: Option<String>,
    pub token_cache_max_ttl_secs: u64,
    pub cron_secret: Option<String>,
    pub request_timeout_secs: u64,
    pub max_concurrent_requests: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, CoreError> {
        Ok(Self {
            port: env_or("PORT", 3000),
            base_url: std::env::var("BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string())
                .trim_end_matches('/')
                .to_string(),
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            database: DatabaseConfig::from_env()?,
            storage: StorageConfig::from_env(),
            upload: UploadPolicy::from_env(),
            use_presigned_urls: env_flag("USE_PRESIGNED_URLS", false),
            presigned_url_expiry: env_or("PRESIGNED_URL_EXPIRY_SECS", 300),
            cdn_domain: std::env::var("CDN_DOMAIN").ok().filter(|s| !s.is_empty()),
            token_cache_max_ttl_secs: env_or("TOKEN_CACHE_MAX_TTL_SECS", 86_400),
            cron_secret: std::env::var("CRON_SECRET").ok().filter(|s| !s.is_empty()),
            request_timeout_secs: env_or("REQUEST_TIMEOUT_SECS", 300),
            max_concurrent_requests: env_or("MAX_CONCURRENT_REQUESTS", 1000),
        })
    }

    pub fn share_link(&self, download_token: &str) -> String {
        format!("{}/d/{}", self.base_url, download_token)
    }

    pub fn manage_link(&self, edit_token: &str) -> String {
        format!("{}/m/{}", self.base_url, edit_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_parsing_normalizes_entries() {
        assert_eq!(parse_list(" .EXE, bat,,  ps1 "), vec!["exe", "bat", "ps1"]);
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn env_or_falls_back_on_garbage() {
        std::env::set_var("CLOVADROP_TEST_NUMBER", "not-a-number");
        assert_eq!(env_or("CLOVADROP_TEST_NUMBER", 42u32), 42);
        std::env::set_var("CLOVADROP_TEST_NUMBER", " 7 ");
        assert_eq!(env_or("CLOVADROP_TEST_NUMBER", 42u32), 7);
        std::env::remove_var("CLOVADROP_TEST_NUMBER");
    }

    #[test]
    fn default_policy_blocks_executables() {
        let policy = UploadPolicy::default();
        assert!(policy.blocked_extensions.contains(&"exe".to_string()));
        assert!(policy.allowed_content_types.is_empty());
    }
}
