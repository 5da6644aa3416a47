//! Object storage for uploaded files.
//!
//! Two backends sit behind the [`Storage`] trait: any S3-compatible bucket
//! (AWS, MinIO, Wasabi, ...) and a local directory used in development.

use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::{config::Region, Client};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::io::ReaderStream;

/// A pinned, boxed stream of bytes for streaming downloads
pub type StorageByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::NotFound(_) => true,
            StorageError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

fn backend<E: std::fmt::Display>(e: E) -> StorageError {
    StorageError::Backend(e.to_string())
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Upload data held in memory
    async fn upload(&self, key: &str, data: Vec<u8>) -> Result<String, StorageError>;

    /// Upload from a file path (streaming)
    async fn upload_from_path(&self, key: &str, path: &Path) -> Result<String, StorageError>;

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Deleting a key that does not exist is not an error
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Presigned URL for direct download.
    /// Returns Ok(None) when the backend cannot presign (local storage).
    async fn presigned_download_url(
        &self,
        key: &str,
        expires_in_secs: u64,
    ) -> Result<Option<String>, StorageError>;

    fn supports_presigned_urls(&self) -> bool;

    /// Stream download, returns (stream, size in bytes)
    async fn download_stream(&self, key: &str) -> Result<(StorageByteStream, u64), StorageError>;

    /// Connectivity check, returns latency in milliseconds
    async fn health_check(&self) -> Result<u64, StorageError>;

    /// Short backend name for health output
    fn backend_name(&self) -> &'static str;
}

pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    /// `endpoint` points the client at a non-AWS provider (MinIO etc.),
    /// which also switches to path-style addressing.
    pub async fn new(bucket: String, endpoint: Option<String>) -> Self {
        let region_provider = RegionProviderChain::default_provider().or_else(Region::new("us-east-1"));
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(region_provider)
            .load()
            .await;

        let client = match endpoint {
            Some(url) => {
                tracing::info!(endpoint = %url, "Using custom S3 endpoint");
                let s3_config = aws_sdk_s3::config::Builder::from(&config)
                    .endpoint_url(url)
                    .force_path_style(true)
                    .build();
                Client::from_conf(s3_config)
            }
            None => Client::new(&config),
        };

        Self { client, bucket }
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn upload(&self, key: &str, data: Vec<u8>) -> Result<String, StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(backend)?;
        Ok(format!("s3://{}/{}", self.bucket, key))
    }

    async fn upload_from_path(&self, key: &str, path: &Path) -> Result<String, StorageError> {
        let body = ByteStream::from_path(path).await.map_err(backend)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(backend)?;
        Ok(format!("s3://{}/{}", self.bucket, key))
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let resp = self.client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| match e.as_service_error() {
                Some(se) if se.is_no_such_key() => StorageError::NotFound(key.to_string()),
                _ => backend(e),
            })?;
        let data = resp.body.collect().await.map_err(backend)?;
        Ok(data.into_bytes().to_vec())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        // S3 DeleteObject is already idempotent
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match e.as_service_error() {
                Some(se) if se.is_not_found() => Ok(false),
                _ => Err(backend(e)),
            },
        }
    }

    async fn presigned_download_url(
        &self,
        key: &str,
        expires_in_secs: u64,
    ) -> Result<Option<String>, StorageError> {
        let presigning_config = PresigningConfig::expires_in(Duration::from_secs(expires_in_secs))
            .map_err(backend)?;

        let presigned_request = self.client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(backend)?;

        Ok(Some(presigned_request.uri().to_string()))
    }

    fn supports_presigned_urls(&self) -> bool {
        true
    }

    async fn download_stream(&self, key: &str) -> Result<(StorageByteStream, u64), StorageError> {
        let resp = self.client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| match e.as_service_error() {
                Some(se) if se.is_no_such_key() => StorageError::NotFound(key.to_string()),
                _ => backend(e),
            })?;

        let size = resp.content_length().unwrap_or(0) as u64;
        let reader_stream = ReaderStream::new(resp.body.into_async_read());

        Ok((Box::pin(reader_stream), size))
    }

    async fn health_check(&self) -> Result<u64, StorageError> {
        let start = Instant::now();
        self.client
            .list_objects_v2()
            .bucket(&self.bucket)
            .max_keys(1)
            .send()
            .await
            .map_err(backend)?;
        Ok(start.elapsed().as_millis() as u64)
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}

pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    /// Keys are relative, slash-separated paths. Anything that could escape
    /// the base directory is rejected.
    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        let relative = Path::new(key);
        let clean = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.base_path.join(relative))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn upload(&self, key: &str, data: Vec<u8>) -> Result<String, StorageError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        Ok(format!("local://{}", path.display()))
    }

    async fn upload_from_path(&self, key: &str, source_path: &Path) -> Result<String, StorageError> {
        let dest_path = self.resolve(key)?;
        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(source_path, &dest_path).await?;
        Ok(format!("local://{}", dest_path.display()))
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.resolve(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn presigned_download_url(
        &self,
        _key: &str,
        _expires_in_secs: u64,
    ) -> Result<Option<String>, StorageError> {
        Ok(None)
    }

    fn supports_presigned_urls(&self) -> bool {
        false
    }

    async fn download_stream(&self, key: &str) -> Result<(StorageByteStream, u64), StorageError> {
        let path = self.resolve(key)?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();

        Ok((Box::pin(ReaderStream::new(file)), size))
    }

    async fn health_check(&self) -> Result<u64, StorageError> {
        let start = Instant::now();
        let metadata = tokio::fs::metadata(&self.base_path).await?;
        if metadata.is_dir() {
            Ok(start.elapsed().as_millis() as u64)
        } else {
            Err(StorageError::Backend(format!(
                "{} is not a directory",
                self.base_path.display()
            )))
        }
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn local_upload_download_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();

        storage.upload("files/abc", b"hello".to_vec()).await.unwrap();
        assert!(storage.exists("files/abc").await.unwrap());
        assert_eq!(storage.download("files/abc").await.unwrap(), b"hello");

        storage.delete("files/abc").await.unwrap();
        assert!(!storage.exists("files/abc").await.unwrap());
        // second delete is a no-op
        storage.delete("files/abc").await.unwrap();
    }

    #[tokio::test]
    async fn local_missing_object_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();

        let err = storage.download("files/missing").await.unwrap_err();
        assert!(err.is_not_found());
        let err = storage.download_stream("files/missing").await.err().unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn local_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();

        for key in ["../etc/passwd", "/etc/passwd", "files/../../x", ""] {
            let err = storage.upload(key, vec![1]).await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidKey(_)), "key {key:?}");
        }
    }

    #[tokio::test]
    async fn local_stream_reports_size() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();

        let src = dir.path().join("src.bin");
        tokio::fs::write(&src, vec![7u8; 20_000]).await.unwrap();
        storage.upload_from_path("files/big", &src).await.unwrap();

        let (stream, size) = storage.download_stream("files/big").await.unwrap();
        assert_eq!(size, 20_000);
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, 20_000);
        assert!(!storage.supports_presigned_urls());
        assert!(storage.presigned_download_url("files/big", 60).await.unwrap().is_none());
    }
}
