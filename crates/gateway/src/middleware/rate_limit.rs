//! Per-class rate limiting using the token bucket algorithm
//!
//! Each operation class (upload, search, chat respond, chat stream) gets its
//! own process-wide bucket refilled once per minute.

use axum::{
    extract::{Request, State},
    middleware::{from_fn_with_state, Next},
    response::{IntoResponse, Response},
    routing::MethodRouter,
};
use cevra_common::{config::RateLimitConfig, errors::AppError, metrics::record_rate_limited};
use governor::{
    clock::QuantaClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter using governor crate
pub type ClassRateLimiter = RateLimiter<NotKeyed, InMemoryState, QuantaClock>;

/// Bucket for one operation class
#[derive(Clone)]
pub struct RouteLimit {
    limiter: Arc<ClassRateLimiter>,
    class: &'static str,
    per_minute: u32,
}

impl RouteLimit {
    /// `None` for a zero limit, which means unlimited
    pub fn per_minute(class: &'static str, per_minute: u32) -> Option<Self> {
        let quota = Quota::per_minute(NonZeroU32::new(per_minute)?);

        Some(Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
            class,
            per_minute,
        })
    }

    pub fn class(&self) -> &'static str {
        self.class
    }
}

/// Limits for every rate-limited operation class
#[derive(Clone, Default)]
pub struct RateLimits {
    pub upload: Option<RouteLimit>,
    pub search: Option<RouteLimit>,
    pub respond: Option<RouteLimit>,
    pub stream: Option<RouteLimit>,
}

impl RateLimits {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        if !config.enabled {
            return Self::default();
        }

        Self {
            upload: RouteLimit::per_minute("upload", config.upload_per_minute),
            search: RouteLimit::per_minute("search", config.search_per_minute),
            respond: RouteLimit::per_minute("chat_respond", config.chat_per_minute),
            stream: RouteLimit::per_minute("chat_stream", config.stream_per_minute),
        }
    }
}

/// Rate limiting middleware
pub async fn enforce(State(limit): State<RouteLimit>, request: Request, next: Next) -> Response {
    if limit.limiter.check().is_err() {
        record_rate_limited(limit.class());
        tracing::warn!(class = limit.class(), "Rate limit exceeded");
        return AppError::RateLimited {
            limit: limit.per_minute,
        }
        .into_response();
    }

    next.run(request).await
}

/// Wrap a method router with the bucket of its class, if any
pub fn limited<S>(route: MethodRouter<S>, limit: Option<&RouteLimit>) -> MethodRouter<S>
where
    S: Clone + Send + Sync + 'static,
{
    match limit {
        Some(limit) => route.layer(from_fn_with_state(limit.clone(), enforce)),
        None => route,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_allows_its_quota_then_refuses() {
        let limit = RouteLimit::per_minute("search", 2).unwrap();
        assert!(limit.limiter.check().is_ok());
        assert!(limit.limiter.check().is_ok());
        assert!(limit.limiter.check().is_err());
    }

    #[test]
    fn test_zero_means_unlimited() {
        assert!(RouteLimit::per_minute("upload", 0).is_none());
    }

    #[test]
    fn test_disabled_config_has_no_buckets() {
        let config = RateLimitConfig {
            enabled: false,
            ..RateLimitConfig::default()
        };
        let limits = RateLimits::from_config(&config);
        assert!(limits.upload.is_none());
        assert!(limits.stream.is_none());

        let limits = RateLimits::from_config(&RateLimitConfig::default());
        assert_eq!(limits.respond.map(|l| l.class()), Some("chat_respond"));
    }
}
