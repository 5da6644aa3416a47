//! Per-client rate limiting.
//!
//! Counters live in Redis so limits hold across instances. When Redis is not
//! configured or errors, an in-process `governor` limiter takes over so a
//! cache outage never disables limiting entirely.

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter as Governor};
use nonzero_ext::nonzero;
use std::collections::HashMap;
use std::num::NonZeroU32;

use crate::cache::{rate_key, Cache};
use crate::config::env_or;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    Upload,
    Download,
    Chat,
    Public,
}

impl RouteClass {
    pub const ALL: [RouteClass; 4] = [
        RouteClass::Upload,
        RouteClass::Download,
        RouteClass::Chat,
        RouteClass::Public,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RouteClass::Upload => "upload",
            RouteClass::Download => "download",
            RouteClass::Chat => "chat",
            RouteClass::Public => "public",
        }
    }
}

/// Requests allowed per client per minute, by route class
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub upload_per_minute: u32,
    pub download_per_minute: u32,
    pub chat_per_minute: u32,
    pub public_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            upload_per_minute: 10,
            download_per_minute: 60,
            chat_per_minute: 120,
            public_per_minute: 120,
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            enabled: crate::config::env_flag("RATE_LIMIT_ENABLED", d.enabled),
            upload_per_minute: env_or("RATE_LIMIT_UPLOAD_PER_MIN", d.upload_per_minute),
            download_per_minute: env_or("RATE_LIMIT_DOWNLOAD_PER_MIN", d.download_per_minute),
            chat_per_minute: env_or("RATE_LIMIT_CHAT_PER_MIN", d.chat_per_minute),
            public_per_minute: env_or("RATE_LIMIT_PUBLIC_PER_MIN", d.public_per_minute),
        }
    }

    /// Every class allows at least one request per window
    fn normalized(self) -> Self {
        Self {
            upload_per_minute: self.upload_per_minute.max(1),
            download_per_minute: self.download_per_minute.max(1),
            chat_per_minute: self.chat_per_minute.max(1),
            public_per_minute: self.public_per_minute.max(1),
            ..self
        }
    }

    pub fn limit_for(&self, class: RouteClass) -> u32 {
        match class {
            RouteClass::Upload => self.upload_per_minute,
            RouteClass::Download => self.download_per_minute,
            RouteClass::Chat => self.chat_per_minute,
            RouteClass::Public => self.public_per_minute,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub retry_after_secs: u64,
}

const WINDOW_SECS: u64 = 60;

pub struct RateLimiter {
    config: RateLimitConfig,
    cache: Option<Cache>,
    fallback: HashMap<RouteClass, DefaultKeyedRateLimiter<String>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, cache: Option<Cache>) -> Self {
        let config = config.normalized();
        let fallback = RouteClass::ALL
            .iter()
            .map(|class| {
                let per_minute = NonZeroU32::new(config.limit_for(*class)).unwrap_or(nonzero!(1u32));
                (*class, Governor::keyed(Quota::per_minute(per_minute)))
            })
            .collect();
        Self { config, cache, fallback }
    }

    pub async fn check(&self, class: RouteClass, client: &str) -> RateDecision {
        let limit = self.config.limit_for(class);
        if !self.config.enabled {
            return RateDecision { allowed: true, limit, remaining: limit, retry_after_secs: 0 };
        }

        if let Some(cache) = &self.cache {
            match cache.hit_window(&rate_key(class.name(), client), WINDOW_SECS).await {
                Ok((hits, reset_in)) => return window_decision(limit, hits, reset_in),
                Err(e) => {
                    tracing::warn!(error = %e, "Redis rate limit check failed, using in-process limiter");
                }
            }
        }

        self.check_local(class, client)
    }

    fn check_local(&self, class: RouteClass, client: &str) -> RateDecision {
        let limit = self.config.limit_for(class);
        let Some(limiter) = self.fallback.get(&class) else {
            return RateDecision { allowed: true, limit, remaining: limit, retry_after_secs: 0 };
        };
        match limiter.check_key(&client.to_string()) {
            Ok(()) => RateDecision { allowed: true, limit, remaining: 0, retry_after_secs: 0 },
            Err(_) => RateDecision {
                allowed: false,
                limit,
                remaining: 0,
                retry_after_secs: (WINDOW_SECS / u64::from(limit.max(1))).max(1),
            },
        }
    }

    /// Drop idle keys from the in-process limiters
    pub fn prune(&self) {
        for limiter in self.fallback.values() {
            limiter.retain_recent();
        }
    }
}

fn window_decision(limit: u32, hits: u64, reset_in: u64) -> RateDecision {
    let allowed = hits <= u64::from(limit);
    RateDecision {
        allowed,
        limit,
        remaining: u64::from(limit).saturating_sub(hits) as u32,
        retry_after_secs: if allowed { 0 } else { reset_in.max(1) },
    }
}
