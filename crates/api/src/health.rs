use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::AppState;

/// Current application version from Cargo.toml
pub const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");

static SERVER_START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

pub fn mark_server_start() {
    SERVER_START.get_or_init(Instant::now);
}

fn get_uptime() -> Duration {
    SERVER_START.get().map(|start| start.elapsed()).unwrap_or_default()
}

fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, minutes, secs)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Basic liveness check
/// GET /health
pub async fn liveness() -> Json<Value> {
    Json(json!({ "status": "ok", "version": CURRENT_VERSION }))
}

#[derive(Debug, Serialize)]
pub struct HealthCheck {
    pub name: &'static str,
    pub status: &'static str,
    pub latency_ms: Option<u64>,
    pub details: Option<Value>,
}

impl HealthCheck {
    fn healthy(name: &'static str, latency_ms: u64, details: Option<Value>) -> Self {
        Self { name, status: "healthy", latency_ms: Some(latency_ms), details }
    }

    fn failed(name: &'static str, status: &'static str, details: Option<Value>) -> Self {
        Self { name, status, latency_ms: None, details }
    }
}

/// Postgres and storage are required; Redis only degrades the service
fn overall_status(checks: &[HealthCheck]) -> &'static str {
    if checks.iter().any(|c| c.status == "unhealthy") {
        "unavailable"
    } else if checks.iter().any(|c| c.status == "degraded") {
        "degraded"
    } else {
        "ready"
    }
}

/// Readiness check: database, Redis, storage and the chat relay
/// GET /health/ready
pub async fn readiness(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let mut checks = Vec::new();

    let started = Instant::now();
    checks.push(match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => HealthCheck::healthy(
            "database",
            started.elapsed().as_millis() as u64,
            Some(json!({
                "pool_size": state.pool.size(),
                "pool_idle": state.pool.num_idle(),
            })),
        ),
        Err(e) => {
            tracing::error!("Database health check failed: {:?}", e);
            HealthCheck::failed("database", "unhealthy", None)
        }
    });

    let started = Instant::now();
    checks.push(match &state.cache {
        Some(cache) if cache.is_available().await => {
            HealthCheck::healthy("redis", started.elapsed().as_millis() as u64, None)
        }
        Some(_) => {
            tracing::warn!("Redis health check failed");
            HealthCheck::failed("redis", "degraded", Some(json!({ "reason": "unreachable" })))
        }
        None => HealthCheck::failed("redis", "degraded", Some(json!({ "reason": "not configured" }))),
    });

    checks.push(match state.storage.health_check().await {
        Ok(latency) => HealthCheck::healthy(
            "storage",
            latency,
            Some(json!({ "backend": state.storage.backend_name() })),
        ),
        Err(e) => {
            tracing::error!("Storage health check failed: {}", e);
            HealthCheck::failed(
                "storage",
                "unhealthy",
                Some(json!({ "backend": state.storage.backend_name() })),
            )
        }
    });

    let relay = state.hub.relay_status();
    checks.push(if !state.hub.is_relayed() {
        HealthCheck::failed("chat_relay", "degraded", Some(json!({ "mode": "local" })))
    } else if relay.is_connected() {
        HealthCheck {
            name: "chat_relay",
            status: "healthy",
            latency_ms: None,
            details: Some(json!({ "mode": "redis", "state": relay })),
        }
    } else {
        HealthCheck::failed("chat_relay", "degraded", Some(json!({ "mode": "redis", "state": relay })))
    });

    let status = overall_status(&checks);
    let uptime = get_uptime().as_secs();
    let body = json!({
        "status": status,
        "version": CURRENT_VERSION,
        "uptime_seconds": uptime,
        "uptime_formatted": format_uptime(uptime),
        "chat_rooms": state.hub.room_count(),
        "checks": checks,
    });

    let code = if status == "unavailable" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(body))
}
