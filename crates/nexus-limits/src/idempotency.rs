//! Idempotency store - replay-safe mutation handling
//!
//! Records keyed by `SHA-256(path:Idempotency-Key)` move through a small
//! state machine: IN_FLIGHT while the handler runs, COMPLETED with a response
//! snapshot on 2xx, FAILED with a short retry cooldown on 5xx. Client errors
//! evict the record so corrections can retry cleanly. The shared kv store is
//! tried first; an in-process map takes over when it is unreachable.

use chrono::{DateTime, Duration, Utc};
use nexus_common::config::IdempotencyConfig;
use nexus_store::KvStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Sentinel stored instead of response bodies over the size cap.
pub const OVERSIZE_SENTINEL: &str = "__PAYLOAD_TOO_LARGE_FINGERPRINT_ONLY__";

const KV_PREFIX: &str = "idem:";

/// Idempotency record lifecycle states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum IdempotencyState {
    #[serde(rename = "IN_FLIGHT")]
    InFlight,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
}

/// Stored idempotency record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub state: IdempotencyState,
    pub request_body_hash: String,
    pub response_code: Option<u16>,
    pub response_body: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// What the middleware should do with a replayed key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayDecision {
    /// No usable record: run the handler.
    Proceed,
    /// A request with this key is IN_FLIGHT, or FAILED within cooldown.
    Conflict { retry_after_secs: u64 },
    /// Replay the stored response verbatim.
    Replay { code: u16, body: String },
    /// Completed but the body was too large to snapshot.
    ReplayFingerprint { original_status: u16 },
    /// Same key, different payload.
    PayloadMismatch,
}

/// Storage and state machine for idempotency records.
pub struct IdempotencyStore {
    kv: Arc<dyn KvStore + Send + Sync>,
    fallback: Mutex<HashMap<String, (IdempotencyRecord, DateTime<Utc>)>>,
    config: IdempotencyConfig,
}

impl IdempotencyStore {
    pub fn new(kv: Arc<dyn KvStore + Send + Sync>, config: IdempotencyConfig) -> Self {
        IdempotencyStore {
            kv,
            fallback: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Cache key: hex SHA-256 over `path:key`.
    pub fn cache_key(path: &str, idempotency_key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{path}:{idempotency_key}").as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Hash of the request body; empty bodies hash to a fixed marker.
    pub fn body_hash(body: &[u8]) -> String {
        if body.is_empty() {
            return "no_body".to_string();
        }
        let mut hasher = Sha256::new();
        hasher.update(body);
        hex::encode(hasher.finalize())
    }

    pub fn max_cached_body_bytes(&self) -> usize {
        self.config.max_cached_body_bytes
    }

    /// Evaluate a replayed key against the stored record.
    pub async fn evaluate(&self, cache_key: &str, body_hash: &str) -> ReplayDecision {
        let Some(record) = self.load(cache_key).await else {
            return ReplayDecision::Proceed;
        };

        // Key reuse with a different payload is rejected in every state.
        if record.request_body_hash != body_hash {
            return ReplayDecision::PayloadMismatch;
        }

        match record.state {
            IdempotencyState::InFlight => ReplayDecision::Conflict {
                retry_after_secs: self.config.failed_cooldown_secs,
            },
            IdempotencyState::Completed => {
                let code = record.response_code.unwrap_or(200);
                match record.response_body.as_deref() {
                    Some(OVERSIZE_SENTINEL) => {
                        ReplayDecision::ReplayFingerprint { original_status: code }
                    }
                    Some(body) => ReplayDecision::Replay {
                        code,
                        body: body.to_string(),
                    },
                    None => ReplayDecision::Replay {
                        code,
                        body: String::new(),
                    },
                }
            }
            IdempotencyState::Failed => {
                let within_cooldown = record.failed_at.is_some_and(|failed| {
                    Utc::now() - failed
                        < Duration::seconds(self.config.failed_cooldown_secs as i64)
                });
                if within_cooldown {
                    ReplayDecision::Conflict {
                        retry_after_secs: self.config.failed_cooldown_secs,
                    }
                } else {
                    // Cooldown passed: treat as a fresh attempt.
                    ReplayDecision::Proceed
                }
            }
        }
    }

    /// Claim the key before running the handler.
    pub async fn mark_in_flight(&self, cache_key: &str, body_hash: &str) {
        self.store(
            cache_key,
            IdempotencyRecord {
                state: IdempotencyState::InFlight,
                request_body_hash: body_hash.to_string(),
                response_code: None,
                response_body: None,
                started_at: Utc::now(),
                completed_at: None,
                failed_at: None,
            },
        )
        .await;
    }

    /// Snapshot a successful response. Oversized bodies become the sentinel.
    pub async fn mark_completed(&self, cache_key: &str, body_hash: &str, code: u16, body: &str) {
        let stored_body = if body.len() > self.config.max_cached_body_bytes {
            OVERSIZE_SENTINEL.to_string()
        } else {
            body.to_string()
        };
        self.store(
            cache_key,
            IdempotencyRecord {
                state: IdempotencyState::Completed,
                request_body_hash: body_hash.to_string(),
                response_code: Some(code),
                response_body: Some(stored_body),
                started_at: Utc::now(),
                completed_at: Some(Utc::now()),
                failed_at: None,
            },
        )
        .await;
    }

    /// Record a failure with the retry cooldown window.
    pub async fn mark_failed(&self, cache_key: &str, body_hash: &str, code: u16) {
        self.store(
            cache_key,
            IdempotencyRecord {
                state: IdempotencyState::Failed,
                request_body_hash: body_hash.to_string(),
                response_code: Some(code),
                response_body: None,
                started_at: Utc::now(),
                completed_at: None,
                failed_at: Some(Utc::now()),
            },
        )
        .await;
    }

    /// Drop the record (client errors are retried without penalty).
    pub async fn evict(&self, cache_key: &str) {
        let kv_key = format!("{KV_PREFIX}{cache_key}");
        if self.kv.delete(&kv_key).await.is_err() {
            debug!("kv delete failed, clearing in-process record");
        }
        self.fallback.lock().remove(cache_key);
    }

    async fn load(&self, cache_key: &str) -> Option<IdempotencyRecord> {
        let kv_key = format!("{KV_PREFIX}{cache_key}");
        match self.kv.get(&kv_key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(_) => {
                // Store unreachable: consult the in-process fallback.
                let mut fallback = self.fallback.lock();
                match fallback.get(cache_key) {
                    Some((record, expires)) if *expires > Utc::now() => Some(record.clone()),
                    Some(_) => {
                        fallback.remove(cache_key);
                        None
                    }
                    None => None,
                }
            }
        }
    }

    async fn store(&self, cache_key: &str, record: IdempotencyRecord) {
        let kv_key = format!("{KV_PREFIX}{cache_key}");
        let raw = match serde_json::to_string(&record) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(error = %e, "Failed to serialize idempotency record");
                return;
            }
        };

        if self.kv.set_ex(&kv_key, &raw, self.config.ttl_secs).await.is_err() {
            debug!("kv set failed, using in-process idempotency fallback");
            let expires = Utc::now() + Duration::seconds(self.config.ttl_secs as i64);
            self.fallback
                .lock()
                .insert(cache_key.to_string(), (record, expires));
        }
    }
}
