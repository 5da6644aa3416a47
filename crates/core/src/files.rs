//! Shared file records in Postgres, with the download-token cache in front.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::cache::Cache;
use crate::error::CoreError;
use crate::models::{NewSharedFile, SharedFile};
use crate::tokens::hash_edit_token;

const COLUMNS: &str = r#"
    id, ulid, name, storage_key, size_bytes, content_type, content_hash, is_archive,
    password_hash, expires_at, max_downloads, download_count, download_token,
    edit_token_hash, uploader_ip, created_at, updated_at
"#;

/// TTL for a cached token mapping: the remaining file lifetime, capped
pub fn token_cache_ttl(file: &SharedFile, now: DateTime<Utc>, max_ttl_secs: u64) -> u64 {
    let remaining = (file.expires_at - now).num_seconds();
    if remaining <= 0 {
        0
    } else {
        (remaining as u64).min(max_ttl_secs)
    }
}

pub async fn insert(pool: &PgPool, new: &NewSharedFile) -> Result<SharedFile, CoreError> {
    let query = format!(
        r#"
        INSERT INTO shared_files (
            id, ulid, name, storage_key, size_bytes, content_type, content_hash, is_archive,
            password_hash, expires_at, max_downloads, download_token, edit_token_hash, uploader_ip
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        RETURNING {}
        "#,
        COLUMNS
    );
    let file = sqlx::query_as::<_, SharedFile>(&query)
        .bind(Uuid::new_v4())
        .bind(&new.ulid)
        .bind(&new.name)
        .bind(&new.storage_key)
        .bind(new.size_bytes)
        .bind(&new.content_type)
        .bind(&new.content_hash)
        .bind(new.is_archive)
        .bind(&new.password_hash)
        .bind(new.expires_at)
        .bind(new.max_downloads)
        .bind(&new.download_token)
        .bind(&new.edit_token_hash)
        .bind(&new.uploader_ip)
        .fetch_one(pool)
        .await?;
    Ok(file)
}

pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<SharedFile>, CoreError> {
    let query = format!("SELECT {} FROM shared_files WHERE id = $1", COLUMNS);
    Ok(sqlx::query_as::<_, SharedFile>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await?)
}

/// Resolve a download token, consulting the cache first.
/// Cache failures are logged and fall through to Postgres.
pub async fn find_by_download_token(
    pool: &PgPool,
    cache: Option<&Cache>,
    token: &str,
    max_ttl_secs: u64,
) -> Result<Option<SharedFile>, CoreError> {
    if let Some(cache) = cache {
        match cache.cached_token(token).await {
            Ok(Some(file_id)) => {
                if let Some(file) = find_by_id(pool, file_id).await? {
                    if file.download_token == token {
                        return Ok(Some(file));
                    }
                }
                // Stale mapping (file deleted or token rotated)
                let _ = cache.forget_token(token).await;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Token cache lookup failed"),
        }
    }

    let query = format!("SELECT {} FROM shared_files WHERE download_token = $1", COLUMNS);
    let file = sqlx::query_as::<_, SharedFile>(&query)
        .bind(token)
        .fetch_optional(pool)
        .await?;

    if let (Some(cache), Some(file)) = (cache, file.as_ref()) {
        let ttl = token_cache_ttl(file, Utc::now(), max_ttl_secs);
        if let Err(e) = cache.cache_token(token, file.id, ttl).await {
            tracing::warn!(error = %e, "Failed to cache download token");
        }
    }

    Ok(file)
}

pub async fn find_by_edit_token(pool: &PgPool, edit_token: &str) -> Result<Option<SharedFile>, CoreError> {
    let query = format!("SELECT {} FROM shared_files WHERE edit_token_hash = $1", COLUMNS);
    Ok(sqlx::query_as::<_, SharedFile>(&query)
        .bind(hash_edit_token(edit_token))
        .fetch_optional(pool)
        .await?)
}

/// Count one download if the file is still available.
/// Returns the new download count, or the reason the download is refused.
pub async fn claim_download(pool: &PgPool, id: Uuid) -> Result<i32, CoreError> {
    let claimed: Option<i32> = sqlx::query_scalar(
        r#"
        UPDATE shared_files
        SET download_count = download_count + 1,
            updated_at = CASE
                WHEN max_downloads IS NOT NULL AND download_count + 1 >= max_downloads THEN NOW()
                ELSE updated_at
            END
        WHERE id = $1
          AND expires_at > NOW()
          AND (max_downloads IS NULL OR download_count < max_downloads)
        RETURNING download_count
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    if let Some(count) = claimed {
        return Ok(count);
    }

    // Work out why, for the right status code
    match find_by_id(pool, id).await? {
        None => Err(CoreError::NotFound),
        Some(file) if file.is_expired_at(Utc::now()) => Err(CoreError::Expired),
        Some(_) => Err(CoreError::DownloadLimitReached),
    }
}

pub async fn update_settings(
    pool: &PgPool,
    id: Uuid,
    password_hash: Option<&str>,
    expires_at: DateTime<Utc>,
    max_downloads: Option<i32>,
) -> Result<SharedFile, CoreError> {
    let query = format!(
        r#"
        UPDATE shared_files
        SET password_hash = $2, expires_at = $3, max_downloads = $4, updated_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        COLUMNS
    );
    sqlx::query_as::<_, SharedFile>(&query)
        .bind(id)
        .bind(password_hash)
        .bind(expires_at)
        .bind(max_downloads)
        .fetch_optional(pool)
        .await?
        .ok_or(CoreError::NotFound)
}

/// Point a record at a new stored object (after an archive edit)
#[allow(clippy::too_many_arguments)]
pub async fn replace_object(
    pool: &PgPool,
    id: Uuid,
    name: &str,
    storage_key: &str,
    size_bytes: i64,
    content_type: &str,
    content_hash: &str,
    is_archive: bool,
) -> Result<SharedFile, CoreError> {
    let query = format!(
        r#"
        UPDATE shared_files
        SET name = $2, storage_key = $3, size_bytes = $4, content_type = $5,
            content_hash = $6, is_archive = $7, updated_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        COLUMNS
    );
    sqlx::query_as::<_, SharedFile>(&query)
        .bind(id)
        .bind(name)
        .bind(storage_key)
        .bind(size_bytes)
        .bind(content_type)
        .bind(content_hash)
        .bind(is_archive)
        .fetch_optional(pool)
        .await?
        .ok_or(CoreError::NotFound)
}

/// Delete the row; chat history and access logs cascade
pub async fn delete(pool: &PgPool, id: Uuid) -> Result<bool, CoreError> {
    let result = sqlx::query("DELETE FROM shared_files WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Files that are expired, or exhausted for longer than `exhausted_grace`.
/// Ids in `exclude` are skipped.
pub async fn cleanup_candidates(
    pool: &PgPool,
    now: DateTime<Utc>,
    exhausted_grace: Duration,
    limit: i64,
    exclude: &[Uuid],
) -> Result<Vec<SharedFile>, CoreError> {
    let query = format!(
        r#"
        SELECT {}
        FROM shared_files
        WHERE (expires_at <= $1
               OR (max_downloads IS NOT NULL
                   AND download_count >= max_downloads
                   AND updated_at <= $2))
          AND NOT (id = ANY($4))
        ORDER BY expires_at ASC
        LIMIT $3
        "#,
        COLUMNS
    );
    Ok(sqlx::query_as::<_, SharedFile>(&query)
        .bind(now)
        .bind(now - exhausted_grace)
        .bind(limit)
        .bind(exclude)
        .fetch_all(pool)
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_expiring_in(secs: i64) -> SharedFile {
        let now = Utc::now();
        SharedFile {
            id: Uuid::new_v4(),
            ulid: String::new(),
            name: "a".into(),
            storage_key: "files/a".into(),
            size_bytes: 1,
            content_type: "text/plain".into(),
            content_hash: String::new(),
            is_archive: false,
            password_hash: None,
            expires_at: now + Duration::seconds(secs),
            max_downloads: None,
            download_count: 0,
            download_token: "t".into(),
            edit_token_hash: "h".into(),
            uploader_ip: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn cache_ttl_follows_remaining_lifetime() {
        let now = Utc::now();
        let ttl = token_cache_ttl(&file_expiring_in(120), now, 3600);
        assert!((118..=120).contains(&ttl));

        assert_eq!(token_cache_ttl(&file_expiring_in(100_000), now, 3600), 3600);
        assert_eq!(token_cache_ttl(&file_expiring_in(-5), now, 3600), 0);
    }
}
