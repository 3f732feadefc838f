// Rate limiting service
// Sliding-window counters in the KV under `ratelimit:<key>:<window>`.
// Read-side failures are fail-open: a broken KV never locks users out.

use serde::Serialize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{instrument, warn};

use crate::app_config::{RateLimitSettings, WindowLimit};
use crate::db::kv::{KeyValueStore, KvError};
use crate::services::monitoring::MonitoringService;

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("Key-value store error: {0}")]
    Kv(#[from] KvError),
}

/// Operations with distinct limit envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitOp {
    Login,
    Register,
    Refresh,
}

impl RateLimitOp {
    fn as_str(&self) -> &'static str {
        match self {
            RateLimitOp::Login => "login",
            RateLimitOp::Register => "register",
            RateLimitOp::Refresh => "refresh",
        }
    }
}

/// Rate limit check result
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u32,
    /// Window reset time (Unix timestamp)
    pub reset_time: u64,
    /// Retry after seconds (if blocked)
    pub retry_after: Option<u64>,
    pub current_count: u32,
}

pub struct RateLimitService {
    kv: Arc<dyn KeyValueStore>,
    settings: RateLimitSettings,
    monitoring: Arc<MonitoringService>,
}

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl RateLimitService {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        settings: RateLimitSettings,
        monitoring: Arc<MonitoringService>,
    ) -> Self {
        Self {
            kv,
            settings,
            monitoring,
        }
    }

    fn limit_for(&self, op: RateLimitOp) -> &WindowLimit {
        match op {
            RateLimitOp::Login => &self.settings.login,
            RateLimitOp::Register => &self.settings.register,
            RateLimitOp::Refresh => &self.settings.refresh,
        }
    }

    fn allowed(limit: &WindowLimit, now: u64) -> RateLimitResult {
        RateLimitResult {
            allowed: true,
            remaining: limit.max_requests,
            reset_time: now + limit.window_seconds,
            retry_after: None,
            current_count: 0,
        }
    }

    /// Check and count one request against the window for `key`.
    #[instrument(skip(self))]
    pub async fn check_rate_limit(&self, op: RateLimitOp, key: &str) -> RateLimitResult {
        let limit = self.limit_for(op);
        let now = now_epoch_secs();

        if !self.settings.enabled || limit.window_seconds == 0 {
            return Self::allowed(limit, now);
        }

        let window_id = now / limit.window_seconds;
        let window_end = (window_id + 1) * limit.window_seconds;
        let counter_key = format!("ratelimit:{}:{}:{}", op.as_str(), key, window_id);

        let count = match self.kv.incr(&counter_key).await {
            Ok(count) => {
                if count == 1 {
                    if let Err(e) = self.kv.expire(&counter_key, limit.window_seconds).await {
                        warn!("Rate limit expire failed for {}: {}", counter_key, e);
                    }
                }
                count.max(0) as u32
            },
            Err(e) => {
                // Fail-open: a broken limiter must not block traffic
                warn!("Rate limit counter failed for {}: {} (failing open)", key, e);
                self.monitoring.increment("ratelimit.errors");
                return Self::allowed(limit, now);
            },
        };

        if count > limit.max_requests {
            self.monitoring.increment("ratelimit.blocked");
            return RateLimitResult {
                allowed: false,
                remaining: 0,
                reset_time: window_end,
                retry_after: Some(limit.block_duration.min(window_end - now).max(1)),
                current_count: count,
            };
        }

        RateLimitResult {
            allowed: true,
            remaining: limit.max_requests - count,
            reset_time: window_end,
            retry_after: None,
            current_count: count,
        }
    }
}
