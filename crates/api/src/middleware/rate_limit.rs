//! Per-IP rate limiting by route class

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use clovadrop_core::rate_limit::{RateDecision, RouteClass};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::AppState;

/// Client IP: first X-Forwarded-For hop, then X-Real-IP, then the socket
pub fn client_ip(headers: &HeaderMap, socket: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|h| h.to_str().ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .or_else(|| socket.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn request_client_ip(req: &Request<Body>) -> String {
    let socket = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    client_ip(req.headers(), socket)
}

fn too_many_requests(decision: &RateDecision) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "error": "Too many requests",
            "retry_after": decision.retry_after_secs
        })),
    )
        .into_response();
    let headers = response.headers_mut();
    headers.insert(header::RETRY_AFTER, HeaderValue::from(decision.retry_after_secs));
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(0u32));
    response
}

async fn enforce(state: &AppState, class: RouteClass, req: Request<Body>, next: Next) -> Response {
    let ip = request_client_ip(&req);
    let decision = state.rate_limiter.check(class, &ip).await;

    if !decision.allowed {
        tracing::warn!(
            client_ip = %ip,
            class = class.name(),
            retry_after = decision.retry_after_secs,
            "Rate limit exceeded"
        );
        return too_many_requests(&decision);
    }

    let mut response = next.run(req).await;
    if decision.limit > 0 {
        let headers = response.headers_mut();
        headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    }
    response
}

pub async fn rate_limit_upload(State(state): State<Arc<AppState>>, req: Request<Body>, next: Next) -> Response {
    enforce(&state, RouteClass::Upload, req, next).await
}

pub async fn rate_limit_download(State(state): State<Arc<AppState>>, req: Request<Body>, next: Next) -> Response {
    enforce(&state, RouteClass::Download, req, next).await
}

pub async fn rate_limit_chat(State(state): State<Arc<AppState>>, req: Request<Body>, next: Next) -> Response {
    enforce(&state, RouteClass::Chat, req, next).await
}

pub async fn rate_limit_public(State(state): State<Arc<AppState>>, req: Request<Body>, next: Next) -> Response {
    enforce(&state, RouteClass::Public, req, next).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn forwarded_for_wins() {
        let h = headers(&[("x-forwarded-for", "203.0.113.7, 10.0.0.1"), ("x-real-ip", "198.51.100.2")]);
        assert_eq!(client_ip(&h, None), "203.0.113.7");
    }

    #[test]
    fn falls_back_to_real_ip_then_socket() {
        let h = headers(&[("x-real-ip", " 198.51.100.2 ")]);
        assert_eq!(client_ip(&h, None), "198.51.100.2");

        let socket: SocketAddr = "192.0.2.10:5555".parse().unwrap();
        assert_eq!(client_ip(&HeaderMap::new(), Some(socket)), "192.0.2.10");
        assert_eq!(client_ip(&headers(&[("x-forwarded-for", "")]), Some(socket)), "192.0.2.10");
        assert_eq!(client_ip(&HeaderMap::new(), None), "unknown");
    }

    #[test]
    fn limited_response_carries_retry_after() {
        let response = too_many_requests(&RateDecision {
            allowed: false,
            limit: 10,
            remaining: 0,
            retry_after_secs: 42,
        });
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");
        assert_eq!(response.headers()["x-ratelimit-limit"], "10");
    }
}
