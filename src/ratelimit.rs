//! Fixed-window in-memory rate limiting for the public endpoints.
//!
//! The counter table is process-local and resets on restart; it bounds
//! abuse, it is not a hard quota.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::state::AppState;

const WINDOW: Duration = Duration::from_secs(60);

/// Hold creation is the scarce operation.
pub const HOLD_CREATE_LIMIT: u32 = 5;
pub const PUBLIC_LIMIT: u32 = 100;

struct Window {
    started: Instant,
    count: u32,
}

#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<String, Window>>>,
    window: Duration,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_window(WINDOW)
    }

    fn with_window(window: Duration) -> Self {
        RateLimiter {
            windows: Arc::new(Mutex::new(HashMap::new())),
            window,
        }
    }

    /// Registers one request under `key`. Returns `None` when allowed, or
    /// the `Retry-After` seconds when the window is exhausted.
    pub fn check(&self, key: &str, limit: u32) -> Option<u64> {
        let mut windows = self.windows.lock().expect("rate limiter poisoned");
        let now = Instant::now();
        if windows.len() > 10_000 {
            let window = self.window;
            windows.retain(|_, w| now.duration_since(w.started) < window);
        }
        let entry = windows.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.count = 0;
        }
        if entry.count >= limit {
            let elapsed = now.duration_since(entry.started);
            return Some((self.window - elapsed).as_secs().max(1));
        }
        entry.count += 1;
        None
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn public_rate_limit(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    let limit = if req.method() == Method::POST && path.ends_with("/hold") {
        HOLD_CREATE_LIMIT
    } else {
        PUBLIC_LIMIT
    };
    let key = format!("{}:{}", addr.ip(), path);
    if let Some(retry_after) = state.limiter.check(&key, limit) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, retry_after.to_string())],
            Json(serde_json::json!({ "error": "Rate limit exceeded" })),
        )
            .into_response();
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_limit_then_blocks() {
        let limiter = RateLimiter::new();
        for _ in 0..HOLD_CREATE_LIMIT {
            assert_eq!(limiter.check("1.2.3.4:/book/x/hold", HOLD_CREATE_LIMIT), None);
        }
        let retry = limiter.check("1.2.3.4:/book/x/hold", HOLD_CREATE_LIMIT);
        assert!(retry.is_some());
        assert!(retry.unwrap() >= 1);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new();
        for _ in 0..HOLD_CREATE_LIMIT {
            assert_eq!(limiter.check("1.2.3.4:/book/x/hold", HOLD_CREATE_LIMIT), None);
        }
        assert_eq!(limiter.check("5.6.7.8:/book/x/hold", HOLD_CREATE_LIMIT), None);
        assert_eq!(limiter.check("1.2.3.4:/book/y/hold", HOLD_CREATE_LIMIT), None);
    }

    #[test]
    fn window_resets_after_expiry() {
        let limiter = RateLimiter::with_window(Duration::from_millis(20));
        for _ in 0..3 {
            assert_eq!(limiter.check("k", 3), None);
        }
        assert!(limiter.check("k", 3).is_some());
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(limiter.check("k", 3), None);
    }
}
