//! Management routes, gated by the edit token

use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::Utc;
use clovadrop_core::models::{AccessAction, AccessLogEntry, SharedFile};
use clovadrop_core::{access_log, files, tokens};
use clovadrop_jobs::cleanup::{purge_file, remove_object};
use clovadrop_jobs::CleanupContext;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::Path as FsPath;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::archive::{self, EntrySource};
use crate::error::{ApiError, ApiResult};
use crate::handlers::{
    archive_entries, blocking, fetch_object, format_bytes, hash_file, new_object_key, scan_staged, stage_field,
    ClientOrigin, StagedFile, Staging,
};
use crate::AppState;

pub const DEFAULT_LOG_LIMIT: i64 = 50;
pub const MAX_LOG_LIMIT: i64 = 200;
const ARCHIVE_LOCK_TTL_SECS: u64 = 300;

async fn resolve_managed(state: &AppState, edit_token: &str) -> ApiResult<SharedFile> {
    if !tokens::looks_like_token(edit_token, tokens::EDIT_TOKEN_LEN) {
        return Err(ApiError::not_found());
    }
    files::find_by_edit_token(&state.pool, edit_token)
        .await?
        .ok_or_else(ApiError::not_found)
}

fn file_details(state: &AppState, file: &SharedFile) -> Value {
    json!({
        "id": file.id,
        "name": file.name,
        "size_bytes": file.size_bytes,
        "size_formatted": format_bytes(file.size_bytes),
        "content_type": file.content_type,
        "content_hash": file.content_hash,
        "is_archive": file.is_archive,
        "requires_password": file.requires_password(),
        "expires_at": file.expires_at,
        "is_expired": file.is_expired_at(Utc::now()),
        "max_downloads": file.max_downloads,
        "download_count": file.download_count,
        "downloads_remaining": file.downloads_remaining(),
        "download_token": file.download_token,
        "share_link": state.config.share_link(&file.download_token),
        "created_at": file.created_at,
        "updated_at": file.updated_at,
    })
}

/// GET /api/manage/{edit_token}
pub async fn get_file(
    State(state): State<Arc<AppState>>,
    Path(edit_token): Path<String>,
) -> ApiResult<Json<Value>> {
    let file = resolve_managed(&state, &edit_token).await?;
    Ok(Json(file_details(&state, &file)))
}

/// Distinguishes an absent field from an explicit `null`
fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Default, Deserialize)]
pub struct SettingsUpdate {
    /// An empty string removes the password
    pub password: Option<String>,
    /// New lifetime counted from now
    pub expires_in_hours: Option<i64>,
    /// `null` removes the limit
    #[serde(default, deserialize_with = "double_option")]
    pub max_downloads: Option<Option<i32>>,
}

/// PUT /api/manage/{edit_token}/settings
pub async fn update_settings(
    State(state): State<Arc<AppState>>,
    Path(edit_token): Path<String>,
    ClientOrigin(origin): ClientOrigin,
    Json(update): Json<SettingsUpdate>,
) -> ApiResult<Json<Value>> {
    let file = resolve_managed(&state, &edit_token).await?;
    let policy = &state.config.upload;
    let mut changed: Vec<&str> = Vec::new();

    let password_hash = match update.password.as_deref() {
        None => file.password_hash.clone(),
        Some("") => {
            changed.push("password_cleared");
            None
        }
        Some(password) => {
            changed.push("password_set");
            Some(tokens::hash_password(password)?)
        }
    };

    let expires_at = match update.expires_in_hours {
        None => file.expires_at,
        Some(hours) => {
            changed.push("expires_at");
            Utc::now() + policy.resolve_expiry(Some(hours))?
        }
    };

    let max_downloads = match update.max_downloads {
        None => file.max_downloads,
        Some(limit) => {
            changed.push("max_downloads");
            policy.resolve_max_downloads(limit)?
        }
    };

    if changed.is_empty() {
        return Err(ApiError::bad_request("Nothing to update"));
    }

    let updated = files::update_settings(
        &state.pool,
        file.id,
        password_hash.as_deref(),
        expires_at,
        max_downloads,
    )
    .await?;

    if let Some(cache) = &state.cache {
        if let Err(e) = cache.forget_token(&file.download_token).await {
            tracing::warn!(file_id = %file.id, error = %e, "Failed to invalidate cached token");
        }
    }

    access_log::record(
        &state.pool,
        file.id,
        AccessAction::SettingsUpdated,
        &origin,
        Some(json!({ "changed": changed })),
    )
    .await;

    tracing::info!(file_id = %file.id, changed = ?changed, "Share settings updated");
    Ok(Json(file_details(&state, &updated)))
}

/// DELETE /api/manage/{edit_token}
pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    Path(edit_token): Path<String>,
    ClientOrigin(origin): ClientOrigin,
) -> ApiResult<StatusCode> {
    let file = resolve_managed(&state, &edit_token).await?;

    // Kept only if the purge below fails
    access_log::record(&state.pool, file.id, AccessAction::Deleted, &origin, None).await;

    let ctx = CleanupContext {
        pool: state.pool.clone(),
        storage: state.storage.clone(),
        cache: state.cache.clone(),
        hub: Some(state.hub.clone()),
        presence: Some(state.presence.clone()),
    };
    purge_file(&ctx, &file).await.map_err(|e| {
        tracing::error!(file_id = %file.id, "Failed to delete share: {}", e);
        ApiError::internal()
    })?;

    tracing::info!(file_id = %file.id, name = %file.name, "Share deleted by owner");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/manage/{edit_token}/entries
pub async fn list_entries(
    State(state): State<Arc<AppState>>,
    Path(edit_token): Path<String>,
) -> ApiResult<Json<Value>> {
    let file = resolve_managed(&state, &edit_token).await?;
    if !file.is_archive {
        return Err(ApiError::bad_request("This share is not an archive"));
    }
    let entries = archive_entries(&state, &file).await?;
    Ok(Json(json!({ "entries": entries, "total": entries.len() })))
}

/// One archive edit at a time per share: an in-process guard, plus a
/// Redis lock when Redis is available.
pub struct ArchiveEditLocks {
    active: Mutex<HashSet<Uuid>>,
}

impl ArchiveEditLocks {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashSet::new()),
        }
    }

    fn try_claim(&self, id: Uuid) -> bool {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).insert(id)
    }

    fn release(&self, id: Uuid) {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
    }
}

impl Default for ArchiveEditLocks {
    fn default() -> Self {
        Self::new()
    }
}

struct ArchiveEdit<'a> {
    state: &'a AppState,
    file_id: Uuid,
    holder: String,
}

impl<'a> ArchiveEdit<'a> {
    /// Take the edit lock and read the row again under it, so the edit starts
    /// from the object the previous edit committed.
    async fn begin(state: &'a AppState, file_id: Uuid) -> ApiResult<(ArchiveEdit<'a>, SharedFile)> {
        let edit = Self::lock(state, file_id).await?;
        match files::find_by_id(&state.pool, file_id).await {
            Ok(Some(file)) => Ok((edit, file)),
            Ok(None) => {
                edit.finish().await;
                Err(ApiError::not_found())
            }
            Err(e) => {
                edit.finish().await;
                Err(e.into())
            }
        }
    }

    async fn lock(state: &'a AppState, file_id: Uuid) -> ApiResult<ArchiveEdit<'a>> {
        let busy = || ApiError::new(StatusCode::CONFLICT, "The archive is being modified, try again shortly");
        if !state.archive_locks.try_claim(file_id) {
            return Err(busy());
        }
        let edit = ArchiveEdit {
            state,
            file_id,
            holder: Uuid::new_v4().to_string(),
        };
        if let Some(cache) = &state.cache {
            match cache.try_lock(&lock_name(file_id), &edit.holder, ARCHIVE_LOCK_TTL_SECS).await {
                Ok(true) => {}
                Ok(false) => return Err(busy()),
                Err(e) => tracing::warn!(error = %e, "Archive lock unavailable, relying on local guard"),
            }
        }
        Ok(edit)
    }

    async fn finish(self) {
        if let Some(cache) = &self.state.cache {
            if let Err(e) = cache.release_lock(&lock_name(self.file_id), &self.holder).await {
                tracing::warn!(file_id = %self.file_id, error = %e, "Failed to release archive lock");
            }
        }
    }
}

impl Drop for ArchiveEdit<'_> {
    fn drop(&mut self) {
        self.state.archive_locks.release(self.file_id);
    }
}

fn lock_name(file_id: Uuid) -> String {
    format!("archive:{}", file_id)
}

/// `report.pdf` becomes `report.zip` when a plain file turns into an archive
fn archive_name_for(name: &str) -> String {
    let stem = FsPath::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("bundle");
    format!("{}.zip", stem)
}

/// How additions apply to the object a share currently points at
#[derive(Debug, PartialEq, Eq)]
struct AdditionPlan {
    source_key: String,
    result_name: String,
    /// Set when a plain file is first wrapped into an archive under this name
    wrap_original: Option<String>,
}

impl AdditionPlan {
    fn for_file(file: &SharedFile) -> Self {
        if file.is_archive {
            Self {
                source_key: file.storage_key.clone(),
                result_name: file.name.clone(),
                wrap_original: None,
            }
        } else {
            Self {
                source_key: file.storage_key.clone(),
                result_name: archive_name_for(&file.name),
                wrap_original: Some(file.name.clone()),
            }
        }
    }
}

/// Upload the rewritten archive, repoint the record and drop the old object
async fn commit_archive(
    state: &AppState,
    file: &SharedFile,
    name: &str,
    local: &FsPath,
) -> ApiResult<SharedFile> {
    let path = local.to_path_buf();
    let (content_hash, size) = blocking(move || hash_file(&path)).await?;
    if size > state.config.upload.max_upload_bytes {
        return Err(clovadrop_core::CoreError::TooLarge(state.config.upload.max_upload_bytes).into());
    }

    let (_ulid, key) = new_object_key();
    state.storage.upload_from_path(&key, local).await?;

    let updated = match files::replace_object(
        &state.pool,
        file.id,
        name,
        &key,
        size as i64,
        "application/zip",
        &content_hash,
        true,
    )
    .await
    {
        Ok(updated) => updated,
        Err(e) => {
            if let Err(cleanup) = remove_object(state.storage.as_ref(), &key).await {
                tracing::warn!(key = %key, error = %cleanup, "Failed to remove orphaned object");
            }
            return Err(e.into());
        }
    };

    if let Err(e) = remove_object(state.storage.as_ref(), &file.storage_key).await {
        tracing::warn!(key = %file.storage_key, error = %e, "Failed to remove replaced object");
    }
    Ok(updated)
}

/// POST /api/manage/{edit_token}/entries
pub async fn add_entries(
    State(state): State<Arc<AppState>>,
    Path(edit_token): Path<String>,
    ClientOrigin(origin): ClientOrigin,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let file = resolve_managed(&state, &edit_token).await?;
    let policy = &state.config.upload;
    let staging = Staging::new().await?;

    let mut staged: Vec<StagedFile> = Vec::new();
    let mut used: u64 = 0;
    while let Some(field) = multipart.next_field().await? {
        if field.file_name().is_none() {
            continue;
        }
        let part = stage_field(field, &staging, policy, policy.max_upload_bytes.saturating_sub(used)).await?;
        used += part.size;
        staged.push(part);
    }
    if staged.is_empty() {
        return Err(ApiError::bad_request("No file provided"));
    }
    scan_staged(&state, &staged, &origin).await?;

    let (edit, locked) = ArchiveEdit::begin(&state, file.id).await?;
    let plan = AdditionPlan::for_file(&locked);
    let converted = plan.wrap_original.is_some();
    let result = async {
        let current = staging.path("current");
        fetch_object(state.storage.as_ref(), &plan.source_key, &current).await?;

        let rewritten = staging.path("rewritten.zip");
        let wrapped = staging.path("wrapped.zip");
        let additions: Vec<EntrySource> = staged.iter().map(StagedFile::as_entry).collect();
        let (wrap, src, dest) = (plan.wrap_original.clone(), current.clone(), rewritten.clone());
        let added = blocking(move || match wrap {
            None => archive::add_entries(&src, &dest, &additions),
            Some(name) => {
                archive::build_archive(&wrapped, &[EntrySource { name, path: src }])?;
                archive::add_entries(&wrapped, &dest, &additions)
            }
        })
        .await?;

        let updated = commit_archive(&state, &locked, &plan.result_name, &rewritten).await?;
        Ok::<_, ApiError>((updated, added))
    }
    .await;
    edit.finish().await;
    let (updated, added) = result?;

    access_log::record(
        &state.pool,
        file.id,
        AccessAction::ArchiveEntryAdded,
        &origin,
        Some(json!({ "entries": added, "converted": converted })),
    )
    .await;

    let entries = archive_entries(&state, &updated).await?;
    tracing::info!(file_id = %file.id, added = added.len(), "Archive entries added");
    Ok(Json(json!({
        "added": added,
        "entries": entries,
        "file": file_details(&state, &updated),
    })))
}

/// DELETE /api/manage/{edit_token}/entries/{*name}
pub async fn remove_entry(
    State(state): State<Arc<AppState>>,
    Path((edit_token, entry)): Path<(String, String)>,
    ClientOrigin(origin): ClientOrigin,
) -> ApiResult<Json<Value>> {
    let file = resolve_managed(&state, &edit_token).await?;
    if !file.is_archive {
        return Err(ApiError::bad_request("This share is not an archive"));
    }

    let staging = Staging::new().await?;
    let (edit, locked) = ArchiveEdit::begin(&state, file.id).await?;
    let result = async {
        if !locked.is_archive {
            return Err(ApiError::bad_request("This share is not an archive"));
        }
        let current = staging.path("current.zip");
        fetch_object(state.storage.as_ref(), &locked.storage_key, &current).await?;

        let rewritten = staging.path("rewritten.zip");
        let (src, dest, name) = (current.clone(), rewritten.clone(), entry.clone());
        blocking(move || archive::remove_entry(&src, &dest, &name)).await?;

        commit_archive(&state, &locked, &locked.name, &rewritten).await
    }
    .await;
    edit.finish().await;
    let updated = result?;

    access_log::record(
        &state.pool,
        file.id,
        AccessAction::ArchiveEntryRemoved,
        &origin,
        Some(json!({ "entry": entry })),
    )
    .await;

    let entries = archive_entries(&state, &updated).await?;
    tracing::info!(file_id = %file.id, entry = %entry, "Archive entry removed");
    Ok(Json(json!({
        "removed": entry,
        "entries": entries,
        "file": file_details(&state, &updated),
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub action: Option<String>,
}

impl LogQuery {
    fn page(&self) -> (i64, i64) {
        let limit = self.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
        let offset = self.offset.unwrap_or(0).max(0);
        (limit, offset)
    }
}

/// GET /api/manage/{edit_token}/logs
pub async fn list_logs(
    State(state): State<Arc<AppState>>,
    Path(edit_token): Path<String>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Json<Value>> {
    let file = resolve_managed(&state, &edit_token).await?;
    let action = match query.action.as_deref().filter(|a| !a.is_empty()) {
        None => None,
        Some(raw) => Some(
            AccessAction::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("Unknown action: {}", raw)))?,
        ),
    };
    let (limit, offset) = query.page();

    let (entries, total): (Vec<AccessLogEntry>, i64) =
        access_log::list(&state.pool, file.id, action, limit, offset).await?;

    Ok(Json(json!({
        "logs": entries,
        "total": total,
        "limit": limit,
        "offset": offset,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_distinguish_null_from_absent() {
        let absent: SettingsUpdate = serde_json::from_str(r#"{"expires_in_hours": 5}"#).unwrap();
        assert_eq!(absent.max_downloads, None);
        assert_eq!(absent.expires_in_hours, Some(5));

        let cleared: SettingsUpdate = serde_json::from_str(r#"{"max_downloads": null}"#).unwrap();
        assert_eq!(cleared.max_downloads, Some(None));

        let set: SettingsUpdate = serde_json::from_str(r#"{"max_downloads": 3, "password": ""}"#).unwrap();
        assert_eq!(set.max_downloads, Some(Some(3)));
        assert_eq!(set.password.as_deref(), Some(""));
    }

    #[test]
    fn log_paging_is_clamped() {
        let q = LogQuery::default();
        assert_eq!(q.page(), (DEFAULT_LOG_LIMIT, 0));

        let q = LogQuery {
            limit: Some(10_000),
            offset: Some(-3),
            action: None,
        };
        assert_eq!(q.page(), (MAX_LOG_LIMIT, 0));

        let q = LogQuery {
            limit: Some(0),
            offset: Some(20),
            action: None,
        };
        assert_eq!(q.page(), (1, 20));
    }

    #[test]
    fn converted_archives_keep_the_stem() {
        assert_eq!(archive_name_for("report.pdf"), "report.zip");
        assert_eq!(archive_name_for("notes"), "notes.zip");
        assert_eq!(archive_name_for("archive.tar.gz"), "archive.tar.zip");
    }

    fn shared_file(name: &str, key: &str, is_archive: bool) -> SharedFile {
        let now = Utc::now();
        SharedFile {
            id: Uuid::new_v4(),
            ulid: ulid::Ulid::new().to_string(),
            name: name.to_string(),
            storage_key: key.to_string(),
            size_bytes: 10,
            content_type: "application/zip".to_string(),
            content_hash: "abc".to_string(),
            is_archive,
            password_hash: None,
            expires_at: now + chrono::Duration::hours(1),
            max_downloads: None,
            download_count: 0,
            download_token: "t".repeat(tokens::DOWNLOAD_TOKEN_LEN),
            edit_token_hash: String::new(),
            uploader_ip: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn additions_build_from_the_locked_row() {
        let before = shared_file("photos.zip", "files/OLD", true);
        let mut after_first_edit = shared_file("photos.zip", "files/NEW", true);
        after_first_edit.id = before.id;

        let plan = AdditionPlan::for_file(&after_first_edit);
        assert_eq!(plan.source_key, "files/NEW");
        assert_eq!(plan.result_name, "photos.zip");
        assert_eq!(plan.wrap_original, None);
        assert_ne!(plan, AdditionPlan::for_file(&before));
    }

    #[test]
    fn plain_files_are_wrapped_before_adding() {
        let plan = AdditionPlan::for_file(&shared_file("report.pdf", "files/A", false));
        assert_eq!(plan.source_key, "files/A");
        assert_eq!(plan.result_name, "report.zip");
        assert_eq!(plan.wrap_original.as_deref(), Some("report.pdf"));
    }

    #[test]
    fn local_edit_guard_is_exclusive() {
        let locks = ArchiveEditLocks::new();
        let id = Uuid::new_v4();
        assert!(locks.try_claim(id));
        assert!(!locks.try_claim(id));
        assert!(locks.try_claim(Uuid::new_v4()));
        locks.release(id);
        assert!(locks.try_claim(id));
    }
}
