//! Nexus Limits - Rate limiting, idempotency, and priority scheduling
//!
//! The traffic-control layer of the supervisor: a distributed token-bucket
//! rate limiter keyed on client IP, a replay-safe idempotency store for
//! mutations, and a priority queue with per-priority concurrency caps.
//! The HTTP-facing middleware lives in the gateway crate; everything here is
//! transport-free engine logic.

mod idempotency;
mod priority_queue;
mod rate_limiter;

pub use idempotency::{
    IdempotencyRecord, IdempotencyState, IdempotencyStore, ReplayDecision, OVERSIZE_SENTINEL,
};
pub use priority_queue::{PriorityQueue, TaskStatus};
pub use rate_limiter::{is_bypassed_path, Bucket, RateLimiter, RateLimitVerdict};
