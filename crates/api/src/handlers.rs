use axum::{
    body::Body,
    extract::{multipart::Field, FromRequestParts, Multipart, Path, Query, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use clovadrop_core::cache::entries_key;
use clovadrop_core::models::{AccessAction, NewSharedFile, RequestOrigin, SharedFile};
use clovadrop_core::validation::extension_of;
use clovadrop_core::virus_scan::{scan_gate, ScanVerdict};
use clovadrop_core::{access_log, files, tokens, CoreError, UploadPolicy};
use clovadrop_storage::Storage;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::io::Read;
use std::net::SocketAddr;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use ulid::Ulid;
use url::Url;
use uuid::Uuid;

use crate::archive::{self, ArchiveEntry, ArchiveError, EntrySource};
use crate::error::{ApiError, ApiResult};
use crate::middleware::rate_limit::client_ip;
use crate::AppState;

pub const DEFAULT_ARCHIVE_NAME: &str = "bundle.zip";
const ENTRIES_CACHE_TTL_SECS: u64 = 3600;

/// Format bytes into human-readable string
pub fn format_bytes(bytes: i64) -> String {
    const KB: i64 = 1024;
    const MB: i64 = KB * 1024;
    const GB: i64 = MB * 1024;
    const TB: i64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Content-Disposition value that cannot break the header.
/// Non-ASCII names get an RFC 5987 `filename*` next to an ASCII fallback.
pub fn content_disposition(filename: &str, disposition: &str) -> String {
    let sanitized: String = filename
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ => c,
        })
        .collect::<String>()
        .trim()
        .to_string();

    if sanitized.is_empty() {
        return format!("{}; filename=\"download\"", disposition);
    }
    if sanitized.is_ascii() {
        return format!("{}; filename=\"{}\"", disposition, sanitized);
    }

    let encoded: String = sanitized
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "-_.~".contains(c) {
                c.to_string()
            } else {
                c.encode_utf8(&mut [0; 4])
                    .bytes()
                    .map(|b| format!("%{:02X}", b))
                    .collect()
            }
        })
        .collect();
    let fallback: String = sanitized
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || "-_.".contains(*c))
        .collect();
    let fallback = if fallback.is_empty() { "download".to_string() } else { fallback };

    format!("{}; filename=\"{}\"; filename*=UTF-8''{}", disposition, fallback, encoded)
}

/// Rewrite a presigned URL onto the CDN host, keeping path and signature
pub fn rewrite_url_to_cdn(presigned: &str, cdn_domain: &str) -> String {
    match Url::parse(presigned) {
        Ok(parsed) => {
            let query = parsed.query().map(|q| format!("?{}", q)).unwrap_or_default();
            format!("https://{}{}{}", cdn_domain, parsed.path(), query)
        }
        Err(_) => presigned.to_string(),
    }
}

/// Content type from the file extension, for parts sent without one
pub fn content_type_for(filename: &str) -> &'static str {
    match extension_of(filename).as_deref() {
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("ogg") => "audio/ogg",
        Some("txt") => "text/plain",
        Some("csv") => "text/csv",
        Some("md") => "text/markdown",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("doc") => "application/msword",
        Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        Some("xls") => "application/vnd.ms-excel",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("ppt") => "application/vnd.ms-powerpoint",
        Some("pptx") => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        Some("zip") => "application/zip",
        Some("tar") => "application/x-tar",
        Some("gz") => "application/gzip",
        _ => "application/octet-stream",
    }
}

/// IP and user agent of the caller, for the access log
pub struct ClientOrigin(pub RequestOrigin);

impl<S: Send + Sync> FromRequestParts<S> for ClientOrigin {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let socket = parts
            .extensions
            .get::<axum::extract::ConnectInfo<SocketAddr>>()
            .map(|info| info.0);
        Ok(ClientOrigin(origin_from(&parts.headers, socket)))
    }
}

pub fn origin_from(headers: &HeaderMap, socket: Option<SocketAddr>) -> RequestOrigin {
    let ip = client_ip(headers, socket);
    RequestOrigin {
        ip_address: (ip != "unknown").then_some(ip),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|h| h.to_str().ok())
            .map(|s| s.chars().take(512).collect()),
    }
}

/// Per-request scratch directory, removed on drop
pub struct Staging {
    dir: PathBuf,
}

impl Staging {
    pub async fn new() -> ApiResult<Self> {
        let dir = std::env::temp_dir().join(format!("clovadrop-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            tracing::error!("Failed to create staging directory: {:?}", e);
            ApiError::internal()
        })?;
        Ok(Self { dir })
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            tracing::warn!("Failed to remove staging directory {:?}: {:?}", self.dir, e);
        }
    }
}

/// An uploaded part written to disk
#[derive(Debug, Clone)]
pub struct StagedFile {
    pub name: String,
    pub content_type: String,
    pub path: PathBuf,
    pub size: u64,
    pub content_hash: String,
}

impl StagedFile {
    pub fn as_entry(&self) -> EntrySource {
        EntrySource {
            name: self.name.clone(),
            path: self.path.clone(),
        }
    }
}

fn io_error(context: &str, e: std::io::Error) -> ApiError {
    tracing::error!("{}: {:?}", context, e);
    ApiError::internal()
}

/// Stream a file part to disk while hashing it. `budget` is what is left
/// of the request's byte allowance; the part is cut off as soon as it
/// goes over.
pub async fn stage_field(
    mut field: Field<'_>,
    staging: &Staging,
    policy: &UploadPolicy,
    budget: u64,
) -> ApiResult<StagedFile> {
    let name = policy.check_name(field.file_name().unwrap_or_default())?;
    let content_type = match field.content_type() {
        Some(ct) if !ct.is_empty() && ct != "application/octet-stream" => ct.to_string(),
        _ => content_type_for(&name).to_string(),
    };
    policy.check_content_type(&content_type)?;

    let path = staging.path(&Uuid::new_v4().to_string());
    let mut temp_file = tokio::fs::File::create(&path)
        .await
        .map_err(|e| io_error("Failed to create temp file", e))?;

    let mut size: u64 = 0;
    let mut hasher = blake3::Hasher::new();
    while let Some(chunk) = field.chunk().await? {
        size += chunk.len() as u64;
        if size > budget {
            return Err(CoreError::TooLarge(policy.max_upload_bytes).into());
        }
        hasher.update(&chunk);
        temp_file
            .write_all(&chunk)
            .await
            .map_err(|e| io_error("Failed to write chunk", e))?;
    }
    temp_file
        .flush()
        .await
        .map_err(|e| io_error("Failed to flush temp file", e))?;
    drop(temp_file);

    policy.check_size(size)?;

    Ok(StagedFile {
        name,
        content_type,
        path,
        size,
        content_hash: hasher.finalize().to_hex().to_string(),
    })
}

/// Run every staged file through the scanner. An infected file rejects
/// the whole request.
pub async fn scan_staged(state: &AppState, staged: &[StagedFile], origin: &RequestOrigin) -> ApiResult<()> {
    for file in staged {
        let verdict = scan_gate(state.scanner.as_deref(), state.scan_fail_open, &file.path, &file.name).await?;
        match verdict {
            ScanVerdict::Clean => {
                tracing::debug!(target: "virus_scan", file_name = %file.name, "Upload scanned clean");
            }
            ScanVerdict::Skipped => {}
            ScanVerdict::Infected { threat } => {
                tracing::warn!(
                    target: "virus_scan",
                    file_name = %file.name,
                    threat = %threat,
                    client_ip = origin.ip_address.as_deref().unwrap_or("unknown"),
                    "Infected upload rejected"
                );
                return Err(ApiError::new(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    format!("{} was rejected: malware detected ({})", file.name, threat),
                ));
            }
        }
    }
    Ok(())
}

/// Run archive work off the async runtime
pub async fn blocking<T, F>(work: F) -> ApiResult<T>
where
    F: FnOnce() -> Result<T, ArchiveError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| {
            tracing::error!("Archive task panicked: {}", e);
            ApiError::internal()
        })?
        .map_err(ApiError::from)
}

/// BLAKE3 hash and size of a file on disk
pub fn hash_file(path: &FsPath) -> Result<(String, u64), ArchiveError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hasher.finalize().to_hex().to_string(), size))
}

/// Copy a stored object into the staging directory
pub async fn fetch_object(storage: &dyn Storage, key: &str, dest: &FsPath) -> ApiResult<()> {
    use futures::StreamExt;

    let (mut stream, _size) = storage.download_stream(key).await?;
    let mut out = tokio::fs::File::create(dest)
        .await
        .map_err(|e| io_error("Failed to create temp file", e))?;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| io_error("Failed to read stored object", e))?;
        out.write_all(&chunk)
            .await
            .map_err(|e| io_error("Failed to write temp file", e))?;
    }
    out.flush().await.map_err(|e| io_error("Failed to flush temp file", e))?;
    Ok(())
}

/// Storage key for a new object
pub fn new_object_key() -> (String, String) {
    let ulid = Ulid::new().to_string();
    let key = format!("files/{}", ulid);
    (ulid, key)
}

/// Archive listing, cached in Redis by content hash
pub async fn archive_entries(state: &AppState, file: &SharedFile) -> ApiResult<Vec<ArchiveEntry>> {
    let key = entries_key(file.id, &file.content_hash);
    if let Some(cache) = &state.cache {
        match cache.get_json::<Vec<ArchiveEntry>>(&key).await {
            Ok(Some(entries)) => return Ok(entries),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Archive listing cache lookup failed"),
        }
    }

    let staging = Staging::new().await?;
    let local = staging.path("archive.zip");
    fetch_object(state.storage.as_ref(), &file.storage_key, &local).await?;
    let entries = blocking(move || archive::list_entries(&local)).await?;

    if let Some(cache) = &state.cache {
        if let Err(e) = cache.set_json(&key, &entries, ENTRIES_CACHE_TTL_SECS).await {
            tracing::warn!(error = %e, "Failed to cache archive listing");
        }
    }
    Ok(entries)
}

/// Resolve a download token to a file, 404 for anything unknown
pub async fn resolve_share(state: &AppState, token: &str) -> ApiResult<SharedFile> {
    if !tokens::looks_like_token(token, tokens::DOWNLOAD_TOKEN_LEN) {
        return Err(ApiError::not_found());
    }
    files::find_by_download_token(
        &state.pool,
        state.cache.as_ref(),
        token,
        state.config.token_cache_max_ttl_secs,
    )
    .await?
    .ok_or_else(ApiError::not_found)
}

/// 410 for shares past their expiry or download limit
pub fn ensure_available(file: &SharedFile) -> ApiResult<()> {
    if file.is_expired_at(Utc::now()) {
        return Err(CoreError::Expired.into());
    }
    if file.is_exhausted() {
        return Err(CoreError::DownloadLimitReached.into());
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
pub struct UploadOptions {
    pub password: Option<String>,
    pub expires_in_hours: Option<i64>,
    pub max_downloads: Option<i32>,
    pub archive_name: Option<String>,
}

impl UploadOptions {
    async fn absorb(&mut self, name: &str, field: Field<'_>) -> ApiResult<()> {
        let value = field.text().await?;
        let value = value.trim();
        if value.is_empty() {
            return Ok(());
        }
        match name {
            "password" => self.password = Some(value.to_string()),
            "expires_in_hours" => {
                self.expires_in_hours = Some(
                    value
                        .parse()
                        .map_err(|_| ApiError::bad_request("expires_in_hours must be a whole number"))?,
                )
            }
            "max_downloads" => {
                self.max_downloads = Some(
                    value
                        .parse()
                        .map_err(|_| ApiError::bad_request("max_downloads must be a whole number"))?,
                )
            }
            "archive_name" => self.archive_name = Some(value.to_string()),
            other => tracing::debug!(field = other, "Ignoring unknown upload field"),
        }
        Ok(())
    }
}

/// Name for a multi-file bundle
fn bundle_name(policy: &UploadPolicy, requested: Option<&str>) -> ApiResult<String> {
    let Some(requested) = requested else {
        return Ok(DEFAULT_ARCHIVE_NAME.to_string());
    };
    let name = policy.check_name(requested)?;
    if extension_of(&name).as_deref() == Some("zip") {
        Ok(name)
    } else {
        Ok(format!("{}.zip", name))
    }
}

/// Upload one or more files and create a share
/// POST /api/upload
pub async fn upload(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UploadOptions>,
    ClientOrigin(origin): ClientOrigin,
    mut multipart: Multipart,
) -> ApiResult<impl IntoResponse> {
    let policy = &state.config.upload;
    let staging = Staging::new().await?;
    let mut options = query;
    let mut staged: Vec<StagedFile> = Vec::new();
    let mut used: u64 = 0;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        if field.file_name().is_none() {
            options.absorb(&name, field).await?;
            continue;
        }
        let file = stage_field(field, &staging, policy, policy.max_upload_bytes.saturating_sub(used)).await?;
        used += file.size;
        staged.push(file);
    }

    if staged.is_empty() {
        return Err(ApiError::bad_request("No file provided"));
    }

    // Validate options before spending time on the scanner
    let lifetime = policy.resolve_expiry(options.expires_in_hours)?;
    let max_downloads = policy.resolve_max_downloads(options.max_downloads)?;
    let password_hash = match options.password.as_deref().filter(|p| !p.is_empty()) {
        Some(password) => Some(tokens::hash_password(password)?),
        None => None,
    };

    scan_staged(&state, &staged, &origin).await?;

    let entry_names: Vec<String>;
    let (name, content_type, path, size, content_hash, is_archive) = if staged.len() == 1 {
        let file = &staged[0];
        entry_names = vec![file.name.clone()];
        let is_zip = extension_of(&file.name).as_deref() == Some("zip");
        let is_archive = if is_zip {
            let path = file.path.clone();
            tokio::task::spawn_blocking(move || archive::is_archive(&path))
                .await
                .unwrap_or(false)
        } else {
            false
        };
        (
            file.name.clone(),
            file.content_type.clone(),
            file.path.clone(),
            file.size,
            file.content_hash.clone(),
            is_archive,
        )
    } else {
        let name = bundle_name(policy, options.archive_name.as_deref())?;
        let dest = staging.path("bundle.zip");
        let sources: Vec<EntrySource> = staged.iter().map(StagedFile::as_entry).collect();
        let dest_clone = dest.clone();
        let (names, (hash, size)) = blocking(move || {
            let names = archive::build_archive(&dest_clone, &sources)?;
            Ok((names, hash_file(&dest_clone)?))
        })
        .await?;
        entry_names = names;
        (name, "application/zip".to_string(), dest, size, hash, true)
    };

    let (ulid, storage_key) = new_object_key();
    state.storage.upload_from_path(&storage_key, &path).await?;

    let download_token = tokens::generate_download_token();
    let edit_token = tokens::generate_edit_token();
    let new_file = NewSharedFile {
        ulid,
        name,
        storage_key: storage_key.clone(),
        size_bytes: size as i64,
        content_type,
        content_hash,
        is_archive,
        password_hash,
        expires_at: Utc::now() + lifetime,
        max_downloads,
        download_token: download_token.clone(),
        edit_token_hash: tokens::hash_edit_token(&edit_token),
        uploader_ip: origin.ip_address.clone(),
    };

    let file = match files::insert(&state.pool, &new_file).await {
        Ok(file) => file,
        Err(e) => {
            if let Err(cleanup) = state.storage.delete(&storage_key).await {
                tracing::warn!(key = %storage_key, error = %cleanup, "Failed to remove orphaned object");
            }
            return Err(e.into());
        }
    };

    if let Some(cache) = &state.cache {
        let ttl = files::token_cache_ttl(&file, Utc::now(), state.config.token_cache_max_ttl_secs);
        if let Err(e) = cache.cache_token(&download_token, file.id, ttl).await {
            tracing::warn!(error = %e, "Failed to cache download token");
        }
    }

    access_log::record(
        &state.pool,
        file.id,
        AccessAction::Upload,
        &origin,
        Some(json!({
            "files": entry_names,
            "size_bytes": file.size_bytes,
            "content_hash": file.content_hash,
        })),
    )
    .await;

    tracing::info!(
        file_id = %file.id,
        name = %file.name,
        size = file.size_bytes,
        files = entry_names.len(),
        "Share created"
    );

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": file.id,
            "name": file.name,
            "size_bytes": file.size_bytes,
            "size_formatted": format_bytes(file.size_bytes),
            "is_archive": file.is_archive,
            "files": entry_names,
            "download_token": download_token,
            "edit_token": edit_token,
            "share_link": state.config.share_link(&download_token),
            "manage_link": state.config.manage_link(&edit_token),
            "expires_at": file.expires_at,
            "max_downloads": file.max_downloads,
        })),
    ))
}

/// Public metadata for a share
/// GET /api/files/{token}/info
pub async fn file_info(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    ClientOrigin(origin): ClientOrigin,
) -> ApiResult<Json<Value>> {
    let file = resolve_share(&state, &token).await?;
    ensure_available(&file)?;

    let entries = if file.is_archive {
        Some(archive_entries(&state, &file).await?)
    } else {
        None
    };

    access_log::record(&state.pool, file.id, AccessAction::View, &origin, None).await;

    Ok(Json(json!({
        "name": file.name,
        "size_bytes": file.size_bytes,
        "size_formatted": format_bytes(file.size_bytes),
        "content_type": file.content_type,
        "is_archive": file.is_archive,
        "requires_password": file.requires_password(),
        "expires_at": file.expires_at,
        "downloads_remaining": file.downloads_remaining(),
        "entries": entries,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadQuery {
    pub password: Option<String>,
}

/// Download a share, counting it against the download limit
/// GET|POST /api/files/{token}/download
pub async fn download(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Query(query): Query<DownloadQuery>,
    headers: HeaderMap,
    ClientOrigin(origin): ClientOrigin,
) -> ApiResult<Response> {
    let file = resolve_share(&state, &token).await?;
    ensure_available(&file)?;

    let supplied = headers
        .get("x-file-password")
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or(query.password);

    if let Err(e) = tokens::check_password(file.password_hash.as_deref(), supplied.as_deref()) {
        let reason = match e {
            CoreError::PasswordRequired => "password_required",
            CoreError::WrongPassword => "wrong_password",
            _ => "error",
        };
        tracing::warn!(
            file_id = %file.id,
            client_ip = origin.ip_address.as_deref().unwrap_or("unknown"),
            reason = reason,
            "Download denied"
        );
        access_log::record(
            &state.pool,
            file.id,
            AccessAction::DownloadDenied,
            &origin,
            Some(json!({ "reason": reason })),
        )
        .await;
        return Err(e.into());
    }

    let count = files::claim_download(&state.pool, file.id).await?;
    access_log::record(
        &state.pool,
        file.id,
        AccessAction::Download,
        &origin,
        Some(json!({ "download_count": count })),
    )
    .await;

    if state.config.use_presigned_urls && state.storage.supports_presigned_urls() {
        match state
            .storage
            .presigned_download_url(&file.storage_key, state.config.presigned_url_expiry)
            .await
        {
            Ok(Some(mut url)) => {
                if let Some(cdn) = &state.config.cdn_domain {
                    url = rewrite_url_to_cdn(&url, cdn);
                }
                tracing::debug!(file_id = %file.id, "Redirecting download to presigned URL");
                return Response::builder()
                    .status(StatusCode::TEMPORARY_REDIRECT)
                    .header(header::LOCATION, url)
                    .header(header::CACHE_CONTROL, "private, max-age=0")
                    .body(Body::empty())
                    .map_err(|e| {
                        tracing::error!("Failed to build redirect: {}", e);
                        ApiError::internal()
                    });
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Presigned URL generation failed, streaming instead: {}", e);
            }
        }
    }

    let (stream, size) = state.storage.download_stream(&file.storage_key).await?;
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, &file.content_type)
        .header(header::CONTENT_LENGTH, size)
        .header(header::CONTENT_DISPOSITION, content_disposition(&file.name, "attachment"))
        .header(header::X_CONTENT_TYPE_OPTIONS, "nosniff")
        .header(header::CACHE_CONTROL, "private, no-store")
        .body(Body::from_stream(stream))
        .map_err(|e| {
            tracing::error!("Failed to build download response: {}", e);
            ApiError::internal()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_formatted() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn disposition_handles_ascii_and_unicode() {
        assert_eq!(
            content_disposition("report.pdf", "attachment"),
            "attachment; filename=\"report.pdf\""
        );
        assert_eq!(
            content_disposition("a\"b\r\n.txt", "attachment"),
            "attachment; filename=\"a_b.txt\""
        );
        let unicode = content_disposition("résumé.pdf", "attachment");
        assert!(unicode.contains("filename=\"rsum.pdf\""));
        assert!(unicode.contains("filename*=UTF-8''r%C3%A9sum%C3%A9.pdf"));
        assert_eq!(content_disposition("\n", "inline"), "inline; filename=\"download\"");
    }

    #[test]
    fn cdn_rewrite_keeps_signature() {
        let url = "https://bucket.s3.amazonaws.com/files/01HX?X-Amz-Signature=abc&X-Amz-Expires=300";
        assert_eq!(
            rewrite_url_to_cdn(url, "cdn.example.com"),
            "https://cdn.example.com/files/01HX?X-Amz-Signature=abc&X-Amz-Expires=300"
        );
        assert_eq!(rewrite_url_to_cdn("not a url", "cdn.example.com"), "not a url");
    }

    #[test]
    fn content_types_by_extension() {
        assert_eq!(content_type_for("a.PDF"), "application/pdf");
        assert_eq!(content_type_for("b.tar.gz"), "application/gzip");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }

    #[test]
    fn bundle_names() {
        let policy = UploadPolicy::default();
        assert_eq!(bundle_name(&policy, None).unwrap(), DEFAULT_ARCHIVE_NAME);
        assert_eq!(bundle_name(&policy, Some("photos")).unwrap(), "photos.zip");
        assert_eq!(bundle_name(&policy, Some("photos.ZIP")).unwrap(), "photos.ZIP");
        assert!(bundle_name(&policy, Some("   ")).is_err());
    }

    #[test]
    fn origin_prefers_forwarded_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9".parse().unwrap());
        headers.insert(header::USER_AGENT, "curl/8".parse().unwrap());
        let origin = origin_from(&headers, None);
        assert_eq!(origin.ip_address.as_deref(), Some("203.0.113.9"));
        assert_eq!(origin.user_agent.as_deref(), Some("curl/8"));
        assert_eq!(origin_from(&HeaderMap::new(), None).ip_address, None);
    }

    #[test]
    fn hash_file_matches_blake3() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.bin");
        std::fs::write(&path, b"hello world").unwrap();
        let (hash, size) = hash_file(&path).unwrap();
        assert_eq!(size, 11);
        assert_eq!(hash, blake3::hash(b"hello world").to_hex().to_string());
    }

    #[tokio::test]
    async fn staging_directory_is_removed_on_drop() {
        let staging = Staging::new().await.unwrap();
        let dir = staging.dir.clone();
        std::fs::write(staging.path("f"), b"x").unwrap();
        assert!(dir.exists());
        drop(staging);
        assert!(!dir.exists());
    }
}
