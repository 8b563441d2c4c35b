use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use redis::{aio::ConnectionManager, AsyncCommands};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::{error::AppError, AppState};

/// Result of counting one hit against a fixed window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub count: u64,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> i64 {
        (self.reset_at - now).num_seconds().max(1)
    }
}

/// Counter backend keyed by client. Counts are best effort and may be lost
/// on restart.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn hit(&self, key: &str, limit: u64, window: Duration) -> Result<RateLimitDecision, AppError>;

    /// Release expired windows. Backends with native expiry do nothing.
    async fn sweep(&self) {}
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u64,
    reset_at: DateTime<Utc>,
}

/// Single-instance fixed-window counters
#[derive(Default)]
pub struct MemoryRateLimitStore {
    windows: RwLock<HashMap<String, Window>>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired windows
    pub async fn cleanup(&self) {
        let now = Utc::now();
        self.windows.write().await.retain(|_, w| w.reset_at > now);
    }

    async fn hit_at(&self, key: &str, limit: u64, window: Duration, now: DateTime<Utc>) -> RateLimitDecision {
        let mut windows = self.windows.write().await;
        let entry = windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            reset_at: now + window,
        });

        if entry.reset_at <= now {
            *entry = Window {
                count: 0,
                reset_at: now + window,
            };
        }
        entry.count += 1;

        RateLimitDecision {
            allowed: entry.count <= limit,
            count: entry.count,
            reset_at: entry.reset_at,
        }
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn hit(&self, key: &str, limit: u64, window: Duration) -> Result<RateLimitDecision, AppError> {
        Ok(self.hit_at(key, limit, window, Utc::now()).await)
    }

    async fn sweep(&self) {
        self.cleanup().await;
    }
}

/// Shared counters for multi-instance deployments (`INCR` + `PEXPIRE`)
#[derive(Clone)]
pub struct RedisRateLimitStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisRateLimitStore {
    pub async fn connect(url: &str) -> Result<Self, AppError> {
        let client = redis::Client::open(url)
            .map_err(|e| AppError::Configuration(format!("invalid REDIS_URL: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::ExternalService(format!("redis connection failed: {e}")))?;
        Ok(Self {
            conn,
            prefix: "inboxpilot:ratelimit".to_string(),
        })
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn hit(&self, key: &str, limit: u64, window: Duration) -> Result<RateLimitDecision, AppError> {
        let key = format!("{}:{}", self.prefix, key);
        let window_ms = window.num_milliseconds().max(1);
        let mut conn = self.conn.clone();
        let redis_err = |e: redis::RedisError| AppError::ExternalService(format!("redis: {e}"));

        let count: u64 = conn.incr(&key, 1u64).await.map_err(redis_err)?;
        if count == 1 {
            let _: i64 = conn.pexpire(&key, window_ms).await.map_err(redis_err)?;
        }
        let ttl_ms: i64 = conn.pttl(&key).await.map_err(redis_err)?;
        let ttl_ms = if ttl_ms > 0 { ttl_ms } else { window_ms };

        Ok(RateLimitDecision {
            allowed: count <= limit,
            count,
            reset_at: Utc::now() + Duration::milliseconds(ttl_ms),
        })
    }
}

/// Client identifier: first `x-forwarded-for` hop, else `unknown`
pub fn client_key(request: &Request) -> String {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Rate limiting middleware for the management APIs
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, (StatusCode, Json<serde_json::Value>)> {
    let key = format!("api:{}", client_key(&request));
    let window = Duration::seconds(state.config.rate_limit_window_secs.max(1) as i64);

    match state
        .rate_limiter
        .hit(&key, state.config.rate_limit_max_requests, window)
        .await
    {
        Ok(decision) if decision.allowed => Ok(next.run(request).await),
        Ok(decision) => Err((
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "success": false,
                "error": "Rate limit exceeded",
                "retry_after": decision.retry_after_secs(Utc::now())
            })),
        )),
        Err(e) => {
            // Counter backend down: fail open
            tracing::warn!(error = %e, "Rate limit check failed");
            Ok(next.run(request).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hit_allows_requests_under_limit() {
        let limiter = MemoryRateLimitStore::new();
        for expected in 1..=3 {
            let d = limiter.hit("client1", 3, Duration::seconds(60)).await.unwrap();
            assert!(d.allowed);
            assert_eq!(d.count, expected);
        }
    }

    #[tokio::test]
    async fn test_hit_blocks_request_over_limit() {
        let limiter = MemoryRateLimitStore::new();
        limiter.hit("client2", 2, Duration::seconds(60)).await.unwrap();
        limiter.hit("client2", 2, Duration::seconds(60)).await.unwrap();
        let third = limiter.hit("client2", 2, Duration::seconds(60)).await.unwrap();
        assert!(!third.allowed);
        assert_eq!(third.count, 3);
    }

    #[tokio::test]
    async fn test_different_keys_are_independent() {
        let limiter = MemoryRateLimitStore::new();
        assert!(limiter.hit("a", 1, Duration::seconds(60)).await.unwrap().allowed);
        assert!(!limiter.hit("a", 1, Duration::seconds(60)).await.unwrap().allowed);
        assert!(limiter.hit("b", 1, Duration::seconds(60)).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_window_resets_after_expiry() {
        let limiter = MemoryRateLimitStore::new();
        let t0 = Utc::now();
        let window = Duration::seconds(10);
        limiter.hit_at("c", 1, window, t0).await;
        assert!(!limiter.hit_at("c", 1, window, t0 + Duration::seconds(5)).await.allowed);

        let after = limiter.hit_at("c", 1, window, t0 + Duration::seconds(11)).await;
        assert!(after.allowed);
        assert_eq!(after.count, 1);
    }

    #[tokio::test]
    async fn test_cleanup_drops_expired_windows() {
        let limiter = MemoryRateLimitStore::new();
        limiter
            .hit_at("old", 1, Duration::seconds(1), Utc::now() - Duration::seconds(10))
            .await;
        limiter.cleanup().await;
        assert!(limiter.windows.read().await.is_empty());
    }
}
