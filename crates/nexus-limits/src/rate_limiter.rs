//! Distributed token-bucket rate limiter
//!
//! Per-client-IP buckets backed by the shared kv store's atomic
//! increment-and-expire. When the store is unreachable the limiter fails
//! open; callers stamp `X-Rate-Limit-Status: degraded` and let the request
//! through.

use nexus_common::config::RateLimitConfig;
use nexus_store::KvStore;
use std::sync::Arc;
use tracing::warn;

/// Rate limit buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Default,
    Admin,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Default => "default",
            Bucket::Admin => "admin",
        }
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone)]
pub struct RateLimitVerdict {
    pub allowed: bool,
    pub current: u64,
    pub limit: u64,
    pub window_secs: u64,
    pub remaining: u64,
}

/// Paths that are never rate-limited.
pub fn is_bypassed_path(path: &str) -> bool {
    matches!(path, "/" | "/favicon.ico" | "/manifest.json")
        || path.starts_with("/health")
        || path == "/healthz"
        || path == "/readyz"
}

/// Token-bucket limiter over the shared kv store.
pub struct RateLimiter {
    kv: Arc<dyn KvStore + Send + Sync>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore + Send + Sync>, config: RateLimitConfig) -> Self {
        RateLimiter { kv, config }
    }

    /// Which bucket a path falls into.
    pub fn bucket_for_path(&self, path: &str) -> Bucket {
        if path.starts_with(&self.config.admin_prefix) {
            Bucket::Admin
        } else {
            Bucket::Default
        }
    }

    /// Check and consume one token.
    ///
    /// Returns `None` when the store is unreachable (fail open).
    pub async fn check(&self, client_ip: &str, bucket: Bucket) -> Option<RateLimitVerdict> {
        let (limit, window) = match bucket {
            Bucket::Default => (self.config.default_limit, self.config.default_window_secs),
            Bucket::Admin => (self.config.admin_limit, self.config.admin_window_secs),
        };

        let key = format!("rl:{client_ip}:{}", bucket.as_str());

        match self.kv.incr_expire(&key, window).await {
            Ok(current) => Some(RateLimitVerdict {
                allowed: current <= limit,
                current,
                limit,
                window_secs: window,
                remaining: limit.saturating_sub(current),
            }),
            Err(e) => {
                warn!(error = %e, "Rate limiter store error, failing open");
                None
            }
        }
    }
}
