//! Per-file access log

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::CoreError;
use crate::models::{AccessAction, AccessLogEntry, RequestOrigin};

/// Record an access. Logging failures never fail the request.
pub async fn record(
    pool: &PgPool,
    file_id: Uuid,
    action: AccessAction,
    origin: &RequestOrigin,
    metadata: Option<Value>,
) {
    let result = sqlx::query(
        r#"
        INSERT INTO access_logs (id, file_id, action, ip_address, user_agent, metadata)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(file_id)
    .bind(action.as_str())
    .bind(&origin.ip_address)
    .bind(&origin.user_agent)
    .bind(metadata)
    .execute(pool)
    .await;

    if let Err(e) = result {
        tracing::warn!(
            file_id = %file_id,
            action = action.as_str(),
            error = %e,
            "Failed to write access log"
        );
    }
}

/// Newest first. Returns the page and the total matching count.
pub async fn list(
    pool: &PgPool,
    file_id: Uuid,
    action: Option<AccessAction>,
    limit: i64,
    offset: i64,
) -> Result<(Vec<AccessLogEntry>, i64), CoreError> {
    let action = action.map(|a| a.as_str());

    let total: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM access_logs WHERE file_id = $1 AND ($2::TEXT IS NULL OR action = $2)",
    )
    .bind(file_id)
    .bind(action)
    .fetch_one(pool)
    .await?;

    let entries = sqlx::query_as::<_, AccessLogEntry>(
        r#"
        SELECT id, file_id, action, ip_address, user_agent, metadata, created_at
        FROM access_logs
        WHERE file_id = $1 AND ($2::TEXT IS NULL OR action = $2)
        ORDER BY created_at DESC, id DESC
        LIMIT $3 OFFSET $4
        "#,
    )
    .bind(file_id)
    .bind(action)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    Ok((entries, total))
}
