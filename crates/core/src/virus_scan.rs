//! Malware scanning through an external scanner HTTP API.
//!
//! Uploads are streamed to the scanner before they reach object storage.
//! The scanner contract is `POST {url}` with the raw bytes as the body and a
//! JSON reply of `{"clean": bool, "threat": "<name>"}`.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio_util::io::ReaderStream;

use crate::config::{env_flag, env_or};

#[derive(Debug, Clone)]
pub struct VirusScanConfig {
    pub enabled: bool,
    pub url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    /// Accept uploads when the scanner is unreachable
    pub fail_open: bool,
}

impl VirusScanConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_flag("VIRUS_SCAN_ENABLED", false),
            url: std::env::var("VIRUS_SCAN_URL")
                .unwrap_or_else(|_| "http://localhost:8090/scan".to_string()),
            api_key: std::env::var("VIRUS_SCAN_API_KEY").ok().filter(|s| !s.is_empty()),
            timeout_secs: env_or("VIRUS_SCAN_TIMEOUT_SECS", 60),
            fail_open: env_flag("VIRUS_SCAN_FAIL_OPEN", false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanVerdict {
    Clean,
    Infected { threat: String },
    /// Scanning disabled, or scanner down with fail-open configured
    Skipped,
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Virus scanner unavailable: {0}")]
    Unavailable(String),

    #[error("Virus scanner returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("Failed to read file for scanning: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait MalwareScanner: Send + Sync {
    async fn scan_file(&self, path: &Path, file_name: &str) -> Result<ScanVerdict, ScanError>;
}

#[derive(Deserialize)]
struct ScanResponse {
    #[serde(alias = "is_clean")]
    clean: bool,
    #[serde(default, alias = "virus")]
    threat: Option<String>,
}

pub struct HttpScanner {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpScanner {
    pub fn new(config: &VirusScanConfig) -> Result<Self, ScanError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ScanError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            url: config.url.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl MalwareScanner for HttpScanner {
    async fn scan_file(&self, path: &Path, file_name: &str) -> Result<ScanVerdict, ScanError> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let mut request = self.client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(reqwest::header::CONTENT_LENGTH, size)
            .header("X-File-Name", file_name.replace(['\r', '\n'], ""))
            .body(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ScanError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ScanError::Unavailable(format!("status {}", response.status())));
        }

        let parsed: ScanResponse = response
            .json()
            .await
            .map_err(|e| ScanError::InvalidResponse(e.to_string()))?;

        Ok(verdict_from(parsed))
    }
}

fn verdict_from(response: ScanResponse) -> ScanVerdict {
    if response.clean {
        ScanVerdict::Clean
    } else {
        ScanVerdict::Infected {
            threat: response.threat.unwrap_or_else(|| "unknown".to_string()),
        }
    }
}

/// Scan a file if a scanner is configured, applying the fail-open policy.
pub async fn scan_gate(
    scanner: Option<&dyn MalwareScanner>,
    fail_open: bool,
    path: &Path,
    file_name: &str,
) -> Result<ScanVerdict, ScanError> {
    let Some(scanner) = scanner else {
        return Ok(ScanVerdict::Skipped);
    };

    match scanner.scan_file(path, file_name).await {
        Ok(verdict) => Ok(verdict),
        Err(e) if fail_open => {
            tracing::warn!(
                target: "virus_scan",
                file_name = file_name,
                error = %e,
                "Scanner failed, accepting upload (fail-open)"
            );
            Ok(ScanVerdict::Skipped)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubScanner(Result<ScanVerdict, ()>);

    #[async_trait]
    impl MalwareScanner for StubScanner {
        async fn scan_file(&self, _path: &Path, _name: &str) -> Result<ScanVerdict, ScanError> {
            self.0
                .clone()
                .map_err(|_| ScanError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn no_scanner_skips() {
        let verdict = scan_gate(None, false, Path::new("/nonexistent"), "a.txt").await.unwrap();
        assert_eq!(verdict, ScanVerdict::Skipped);
    }

    #[tokio::test]
    async fn infected_verdict_passes_through() {
        let scanner = StubScanner(Ok(ScanVerdict::Infected { threat: "EICAR".to_string() }));
        let verdict = scan_gate(Some(&scanner), true, Path::new("x"), "a.txt").await.unwrap();
        assert_eq!(verdict, ScanVerdict::Infected { threat: "EICAR".to_string() });
    }

    #[tokio::test]
    async fn outage_respects_fail_policy() {
        let scanner = StubScanner(Err(()));
        let closed = scan_gate(Some(&scanner), false, Path::new("x"), "a.txt").await;
        assert!(matches!(closed, Err(ScanError::Unavailable(_))));

        let open = scan_gate(Some(&scanner), true, Path::new("x"), "a.txt").await.unwrap();
        assert_eq!(open, ScanVerdict::Skipped);
    }

    #[test]
    fn response_parsing_accepts_aliases() {
        let parsed: ScanResponse = serde_json::from_str(r#"{"is_clean": false, "virus": "Eicar-Test"}"#).unwrap();
        assert_eq!(verdict_from(parsed), ScanVerdict::Infected { threat: "Eicar-Test".to_string() });

        let parsed: ScanResponse = serde_json::from_str(r#"{"clean": true}"#).unwrap();
        assert_eq!(verdict_from(parsed), ScanVerdict::Clean);
    }
}
