//! Externally triggered cleanup, for platforms with their own cron

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::Json,
};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::AppState;

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// `Authorization: Bearer <secret>`
pub fn bearer_matches(headers: &HeaderMap, secret: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.trim().strip_prefix("Bearer "))
        .is_some_and(|token| constant_time_eq(token.trim(), secret))
}

/// Run one cleanup pass
/// POST /api/cron/cleanup
pub async fn run_cleanup(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    // Without a configured secret the route does not exist
    let secret = state.config.cron_secret.as_deref().ok_or(StatusCode::NOT_FOUND)?;
    if !bearer_matches(&headers, secret) {
        tracing::warn!("Rejected cleanup trigger with a bad or missing secret");
        return Err(StatusCode::UNAUTHORIZED);
    }

    match state.cleanup.run_once().await {
        Ok(Some(report)) => Ok(Json(json!({
            "status": "completed",
            "scanned": report.scanned,
            "deleted": report.deleted,
            "failed": report.failed,
        }))),
        Ok(None) => Ok(Json(json!({
            "status": "skipped",
            "reason": "another cleanup run holds the lock",
        }))),
        Err(e) => {
            tracing::error!("Triggered cleanup failed: {}", e);
            Err(StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn with_auth(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn bearer_secret_must_match_exactly() {
        assert!(bearer_matches(&with_auth("Bearer s3cret"), "s3cret"));
        assert!(bearer_matches(&with_auth("  Bearer s3cret  "), "s3cret"));
        assert!(!bearer_matches(&with_auth("Bearer s3cre"), "s3cret"));
        assert!(!bearer_matches(&with_auth("Basic s3cret"), "s3cret"));
        assert!(!bearer_matches(&HeaderMap::new(), "s3cret"));
    }
}
