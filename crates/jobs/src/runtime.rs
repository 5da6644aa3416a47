//! Connection setup shared by the server and the one-shot jobs

use clovadrop_core::config::{DatabaseConfig, StorageConfig};
use clovadrop_storage::{LocalStorage, S3Storage, Storage, StorageError};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

pub async fn connect_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    tracing::info!(
        "Connecting to database (max_conn: {}, min_conn: {})...",
        config.max_connections,
        config.min_connections
    );

    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
        .connect(&config.url)
        .await
}

pub async fn connect_storage(config: &StorageConfig) -> Result<Arc<dyn Storage>, StorageError> {
    let storage: Arc<dyn Storage> = match config {
        StorageConfig::S3 { bucket, endpoint } => {
            tracing::info!(bucket = %bucket, "Using S3 storage");
            Arc::new(S3Storage::new(bucket.clone(), endpoint.clone()).await)
        }
        StorageConfig::Local { path } => {
            tracing::info!(path = %path, "Using local storage");
            Arc::new(LocalStorage::new(path)?)
        }
    };
    Ok(storage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_storage_is_created_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/uploads");
        let storage = connect_storage(&StorageConfig::Local {
            path: path.to_string_lossy().into_owned(),
        })
        .await
        .unwrap();
        assert_eq!(storage.backend_name(), "local");
        assert!(path.is_dir());
    }
}
