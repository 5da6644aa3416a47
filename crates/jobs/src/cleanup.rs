//! Removal of expired and exhausted shares

use chrono::{Duration, Utc};
use clovadrop_chat::{ChatHub, PresenceService};
use clovadrop_core::config::{env_flag, env_or};
use clovadrop_core::models::SharedFile;
use clovadrop_core::cache::entries_pattern;
use clovadrop_core::{files, Cache};
use clovadrop_storage::{Storage, StorageError};
use serde::Serialize;
use sqlx::PgPool;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use crate::scheduler::SchedulerError;

pub const DEFAULT_CLEANUP_CRON: &str = "0 */5 * * * *";

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub enabled: bool,
    pub cron: String,
    pub batch_size: i64,
    pub exhausted_grace_minutes: i64,
    pub lock_ttl_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cron: DEFAULT_CLEANUP_CRON.to_string(),
            batch_size: 100,
            exhausted_grace_minutes: 10,
            lock_ttl_secs: 300,
        }
    }
}

impl CleanupConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_flag("CLEANUP_ENABLED", defaults.enabled),
            cron: std::env::var("CLEANUP_CRON")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.cron),
            batch_size: env_or("CLEANUP_BATCH_SIZE", defaults.batch_size).max(1),
            exhausted_grace_minutes: env_or("EXHAUSTED_GRACE_MINUTES", defaults.exhausted_grace_minutes).max(0),
            lock_ttl_secs: env_or("CLEANUP_LOCK_TTL_SECS", defaults.lock_ttl_secs).max(1),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct CleanupReport {
    pub scanned: usize,
    pub deleted: usize,
    pub failed: usize,
    #[serde(skip)]
    pub deleted_ids: Vec<Uuid>,
}

/// Everything a cleanup run touches
#[derive(Clone)]
pub struct CleanupContext {
    pub pool: PgPool,
    pub storage: Arc<dyn Storage>,
    pub cache: Option<Cache>,
    pub hub: Option<Arc<ChatHub>>,
    pub presence: Option<Arc<PresenceService>>,
}

/// Delete a stored object, treating an already-missing object as done
pub async fn remove_object(storage: &dyn Storage, key: &str) -> Result<(), StorageError> {
    match storage.delete(key).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Delete one share everywhere: object, row (chat and logs cascade),
/// cached token, live chat room.
pub async fn purge_file(ctx: &CleanupContext, file: &SharedFile) -> Result<(), SchedulerError> {
    remove_object(ctx.storage.as_ref(), &file.storage_key)
        .await
        .map_err(|e| SchedulerError::ExecutionFailed(format!("storage: {}", e)))?;

    files::delete(&ctx.pool, file.id)
        .await
        .map_err(|e| SchedulerError::DatabaseError(e.to_string()))?;

    if let Some(cache) = &ctx.cache {
        if let Err(e) = cache.forget_token(&file.download_token).await {
            tracing::warn!(file_id = %file.id, error = %e, "Failed to drop cached token");
        }
        if let Err(e) = cache.delete_pattern(&entries_pattern(file.id)).await {
            tracing::warn!(file_id = %file.id, error = %e, "Failed to drop cached archive listing");
        }
    }

    release_room(ctx, file.id).await;
    Ok(())
}

/// Tell live clients the room is gone and drop local presence for it
pub async fn release_room(ctx: &CleanupContext, file_id: Uuid) {
    if let Some(hub) = &ctx.hub {
        hub.close_room(file_id).await;
    }
    if let Some(presence) = &ctx.presence {
        presence.forget_room(file_id);
    }
}

/// Run cleanup in batches until nothing is left or a batch makes no
/// progress. Rows that fail stay for the next run.
pub async fn run_cleanup(ctx: &CleanupContext, config: &CleanupConfig) -> Result<CleanupReport, SchedulerError> {
    let grace = Duration::minutes(config.exhausted_grace_minutes);
    let batch_size = config.batch_size;

    let report = drain(
        batch_size,
        move |exclude| async move {
            files::cleanup_candidates(&ctx.pool, Utc::now(), grace, batch_size, &exclude)
                .await
                .map_err(|e| SchedulerError::DatabaseError(e.to_string()))
        },
        move |file| async move { purge_file(ctx, &file).await },
    )
    .await?;

    tracing::info!(
        scanned = report.scanned,
        deleted = report.deleted,
        failed = report.failed,
        "Cleanup finished"
    );
    Ok(report)
}

/// Batch loop behind `run_cleanup`. A row that fails to purge is excluded
/// from later batches of the same run.
async fn drain<F, FF, P, PF>(batch_size: i64, mut fetch: F, mut purge: P) -> Result<CleanupReport, SchedulerError>
where
    F: FnMut(Vec<Uuid>) -> FF,
    FF: Future<Output = Result<Vec<SharedFile>, SchedulerError>>,
    P: FnMut(SharedFile) -> PF,
    PF: Future<Output = Result<(), SchedulerError>>,
{
    let mut report = CleanupReport::default();
    let mut failed_ids: Vec<Uuid> = Vec::new();

    loop {
        let batch = fetch(failed_ids.clone()).await?;
        let batch_len = batch.len();
        report.scanned += batch_len;

        let mut progressed = 0;
        for file in batch {
            let (id, name) = (file.id, file.name.clone());
            match purge(file).await {
                Ok(()) => {
                    tracing::debug!(file_id = %id, name = %name, "Removed expired share");
                    report.deleted += 1;
                    report.deleted_ids.push(id);
                    progressed += 1;
                }
                Err(e) => {
                    tracing::error!(file_id = %id, error = %e, "Failed to remove expired share");
                    report.failed += 1;
                    failed_ids.push(id);
                }
            }
        }

        if (batch_len as i64) < batch_size || progressed == 0 {
            break;
        }
    }
    Ok(report)
}
