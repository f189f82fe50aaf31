use axum::{
    extract::{ConnectInfo, Request},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use governor::{
    clock::DefaultClock,
    state::keyed::DefaultKeyedStateStore,
    Quota, RateLimiter,
};
use std::{net::IpAddr, net::SocketAddr, num::NonZeroU32, sync::Arc};
use tracing::warn;

pub const REQUESTS_PER_MINUTE: u32 = 60;
pub const TASK_REQUESTS_PER_MINUTE: u32 = 10;

type KeyedLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

#[derive(Clone)]
pub struct RateLimitConfig {
    pub general_limiter: Arc<KeyedLimiter>,
    pub task_limiter: Arc<KeyedLimiter>,
}

impl RateLimitConfig {
    pub fn new() -> Self {
        let general_quota = Quota::per_minute(NonZeroU32::new(REQUESTS_PER_MINUTE).unwrap());
        let task_quota = Quota::per_minute(NonZeroU32::new(TASK_REQUESTS_PER_MINUTE).unwrap());

        Self {
            general_limiter: Arc::new(RateLimiter::keyed(general_quota)),
            task_limiter: Arc::new(RateLimiter::keyed(task_quota)),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn rate_limit_middleware(
    axum::extract::State(limits): axum::extract::State<RateLimitConfig>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let ip = extract_client_ip(&request)
        .and_then(|s| s.parse().ok())
        .unwrap_or(addr.ip());

    let is_task_creation = request.uri().path().starts_with("/tasks") && request.method() == "POST";

    let limiter = if is_task_creation {
        &limits.task_limiter
    } else {
        &limits.general_limiter
    };

    if limiter.check_key(&ip).is_err() {
        warn!("rate limit exceeded for {ip}");
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }

    Ok(next.run(request).await)
}

pub fn extract_client_ip(request: &Request) -> Option<String> {
    if let Some(forwarded_for) = request.headers().get("x-forwarded-for") {
        if let Ok(ip_str) = forwarded_for.to_str() {
            if let Some(first_ip) = ip_str.split(',').next() {
                return Some(first_ip.trim().to_string());
            }
        }
    }

    request
        .headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_limiter_allows_first_request() {
        let config = RateLimitConfig::new();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(config.general_limiter.check_key(&ip).is_ok());
        assert!(config.task_limiter.check_key(&ip).is_ok());
    }

    #[test]
    fn task_limiter_is_more_restrictive_than_general() {
        let config = RateLimitConfig::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let mut task_allowed = 0;
        for _ in 0..(TASK_REQUESTS_PER_MINUTE + 5) {
            if config.task_limiter.check_key(&ip).is_ok() {
                task_allowed += 1;
            }
        }
        assert_eq!(task_allowed, TASK_REQUESTS_PER_MINUTE as i32);
    }
}
