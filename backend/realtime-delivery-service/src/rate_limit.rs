//! Per-user sliding-window rate limiting.
//!
//! Counts live in fixed windows keyed `rate_limit:user:{id}:{window}`; the
//! effective rate weights the previous window by how much of it still
//! overlaps the sliding window. Counter backend failures and timeouts fail
//! open.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

use crate::config::RateLimitConfig;
use crate::error::AppError;
use crate::metrics;

/// Counts for the current and previous fixed windows after recording a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCounts {
    pub current: u64,
    pub previous: u64,
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn hit(
        &self,
        user_id: Uuid,
        window_index: u64,
        window_seconds: u64,
    ) -> Result<WindowCounts, String>;
}

fn window_key(user_id: Uuid, window_index: u64) -> String {
    format!("rate_limit:user:{user_id}:{window_index}")
}

pub struct RedisRateLimitStore {
    conn: ConnectionManager,
}

impl RedisRateLimitStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self::new(ConnectionManager::new(client).await?))
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn hit(
        &self,
        user_id: Uuid,
        window_index: u64,
        window_seconds: u64,
    ) -> Result<WindowCounts, String> {
        let mut conn = self.conn.clone();
        let current_key = window_key(user_id, window_index);
        let previous_key = window_key(user_id, window_index.saturating_sub(1));

        let (current, previous): (u64, Option<u64>) = redis::pipe()
            .atomic()
            .incr(&current_key, 1)
            .expire(&current_key, (window_seconds * 2) as i64)
            .ignore()
            .get(&previous_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| format!("redis pipeline failed: {e}"))?;

        Ok(WindowCounts {
            current,
            previous: if window_index == 0 { 0 } else { previous.unwrap_or(0) },
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct UserWindows {
    index: u64,
    current: u64,
    previous: u64,
}

/// Process-local counters for single-node deployments and tests.
#[derive(Default)]
pub struct MemoryRateLimitStore {
    windows: DashMap<Uuid, UserWindows>,
    swept_window: AtomicU64,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracked_users(&self) -> usize {
        self.windows.len()
    }

    /// Once per window, drop users whose counts no longer reach into the
    /// sliding window.
    fn sweep(&self, window_index: u64) {
        if self.swept_window.fetch_max(window_index, Ordering::Relaxed) >= window_index {
            return;
        }
        let before = self.windows.len();
        self.windows.retain(|_, w| w.index + 1 >= window_index);
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            tracing::debug!(removed, window_index, "expired rate limit windows swept");
        }
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn hit(
        &self,
        user_id: Uuid,
        window_index: u64,
        _window_seconds: u64,
    ) -> Result<WindowCounts, String> {
        self.sweep(window_index);
        let mut entry = self.windows.entry(user_id).or_insert(UserWindows {
            index: window_index,
            current: 0,
            previous: 0,
        });
        let w = entry.value_mut();
        if window_index == w.index + 1 {
            w.previous = w.current;
            w.current = 0;
        } else if window_index > w.index {
            w.previous = 0;
            w.current = 0;
        }
        w.index = w.index.max(window_index);
        w.current += 1;
        Ok(WindowCounts {
            current: w.current,
            previous: w.previous,
        })
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    /// `surface` labels the rejection metric ("http" or "socket").
    pub async fn check(&self, user_id: Uuid, surface: &'static str) -> Result<(), AppError> {
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        self.check_at(user_id, surface, now_ms).await
    }

    async fn check_at(
        &self,
        user_id: Uuid,
        surface: &'static str,
        now_ms: u64,
    ) -> Result<(), AppError> {
        let window_ms = self.config.window_seconds.max(1) * 1000;
        let window_index = now_ms / window_ms;
        let elapsed_ms = now_ms % window_ms;

        let counts = match timeout(
            Duration::from_millis(self.config.redis_timeout_ms),
            self.store
                .hit(user_id, window_index, self.config.window_seconds),
        )
        .await
        {
            Ok(Ok(counts)) => counts,
            Ok(Err(e)) => {
                tracing::warn!(user_id = %user_id, error = %e, "rate limit store error, allowing request");
                return Ok(());
            }
            Err(_) => {
                tracing::warn!(
                    user_id = %user_id,
                    timeout_ms = self.config.redis_timeout_ms,
                    "rate limit store timeout, allowing request"
                );
                return Ok(());
            }
        };

        let overlap = 1.0 - elapsed_ms as f64 / window_ms as f64;
        let estimate = counts.previous as f64 * overlap + counts.current as f64;
        if estimate <= self.config.max_requests as f64 {
            return Ok(());
        }

        metrics::RATE_LIMIT_REJECTIONS
            .with_label_values(&[surface])
            .inc();
        let retry_after_secs = ((window_ms - elapsed_ms) / 1000).max(1);
        tracing::debug!(user_id = %user_id, surface, estimate, "rate limit exceeded");
        Err(AppError::RateLimited { retry_after_secs })
    }
}
