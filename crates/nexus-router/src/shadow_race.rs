//! Shadow-race execution - the patient data pattern
//!
//! Launch the live branch, wait up to the patience budget, and serve cache
//! when patience runs out. The live branch is never cancelled on a patience
//! miss: it keeps running detached, and its eventual result is published to
//! SSE listeners and stored for one-shot retrieval.

use crate::broadcaster::SseBroadcaster;
use chrono::{DateTime, Utc};
use nexus_common::Result;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Source of returned data.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    /// Fresh from API/computation
    Live,
    /// From cache due to timeout
    Cache,
    /// From fallback after failure
    Fallback,
    /// Old cached data, may be outdated
    Stale,
}

/// Result from a shadow-race execution.
#[derive(Debug, Clone, Serialize)]
pub struct ShadowRaceResult {
    pub data: Option<serde_json::Value>,
    pub source: DataSource,
    pub late_arrival_pending: bool,
    pub execution_time_ms: f64,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ShadowRaceResult {
    pub fn success(&self) -> bool {
        self.data.is_some() && self.error.is_none()
    }
}

/// Data that arrived after the patience threshold.
#[derive(Debug, Clone, Serialize)]
pub struct LateArrival {
    pub request_id: String,
    pub endpoint: String,
    pub data: serde_json::Value,
    pub delay_ms: f64,
    pub arrival_time: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Serialize)]
struct RaceStats {
    total_requests: u64,
    cache_served: u64,
    live_served: u64,
    late_arrivals: u64,
    failures: u64,
}

/// Shadow-race executor.
pub struct ShadowRace {
    broadcaster: Arc<SseBroadcaster>,
    pending: Arc<Mutex<HashMap<String, tokio::task::AbortHandle>>>,
    stats: Arc<Mutex<RaceStats>>,
    last_resort_wait_ms: u64,
}

impl ShadowRace {
    pub fn new(broadcaster: Arc<SseBroadcaster>, last_resort_wait_ms: u64) -> Self {
        ShadowRace {
            broadcaster,
            pending: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(Mutex::new(RaceStats::default())),
            last_resort_wait_ms,
        }
    }

    /// Execute the patient data pattern.
    ///
    /// `live_task` runs concurrently; if it beats `patience_ms` its result is
    /// served as live. Otherwise `cache_fallback` is served immediately and
    /// the live branch is detached, publishing on completion.
    pub async fn execute<L, C>(
        &self,
        live_task: L,
        cache_fallback: C,
        patience_ms: u64,
        request_id: &str,
        endpoint: &str,
    ) -> ShadowRaceResult
    where
        L: Future<Output = Result<serde_json::Value>> + Send + 'static,
        C: Future<Output = Result<serde_json::Value>> + Send,
    {
        let start = Instant::now();
        let started_at = Utc::now();
        self.stats.lock().total_requests += 1;

        let mut live_handle = tokio::spawn(live_task);

        match tokio::time::timeout(Duration::from_millis(patience_ms), &mut live_handle).await {
            // Live branch finished within patience.
            Ok(join_result) => {
                let elapsed = start.elapsed().as_secs_f64() * 1000.0;
                match join_result {
                    Ok(Ok(data)) => {
                        self.stats.lock().live_served += 1;
                        info!(endpoint, elapsed_ms = elapsed as u64, "Live returned in time");
                        ShadowRaceResult {
                            data: Some(data),
                            source: DataSource::Live,
                            late_arrival_pending: false,
                            execution_time_ms: elapsed,
                            error: None,
                            timestamp: Utc::now(),
                        }
                    }
                    Ok(Err(e)) => {
                        self.stats.lock().failures += 1;
                        warn!(endpoint, error = %e, "Live branch failed");
                        ShadowRaceResult {
                            data: None,
                            source: DataSource::Fallback,
                            late_arrival_pending: false,
                            execution_time_ms: elapsed,
                            error: Some(e.to_string()),
                            timestamp: Utc::now(),
                        }
                    }
                    Err(join_err) => {
                        self.stats.lock().failures += 1;
                        ShadowRaceResult {
                            data: None,
                            source: DataSource::Fallback,
                            late_arrival_pending: false,
                            execution_time_ms: elapsed,
                            error: Some(join_err.to_string()),
                            timestamp: Utc::now(),
                        }
                    }
                }
            }
            // Patience exceeded: serve cache, detach the live branch.
            Err(_) => {
                info!(endpoint, patience_ms, "Patience exceeded, serving cache");

                match cache_fallback.await {
                    Ok(cached) => {
                        let elapsed = start.elapsed().as_secs_f64() * 1000.0;
                        self.stats.lock().cache_served += 1;
                        self.detach_live(live_handle, request_id, endpoint, started_at);
                        ShadowRaceResult {
                            data: Some(cached),
                            source: DataSource::Cache,
                            late_arrival_pending: true,
                            execution_time_ms: elapsed,
                            error: None,
                            timestamp: Utc::now(),
                        }
                    }
                    Err(cache_err) => {
                        warn!(endpoint, error = %cache_err, "Cache fallback failed");

                        // Last resort: give the live branch a little longer.
                        match tokio::time::timeout(
                            Duration::from_millis(self.last_resort_wait_ms),
                            &mut live_handle,
                        )
                        .await
                        {
                            Ok(Ok(Ok(data))) => {
                                self.stats.lock().live_served += 1;
                                ShadowRaceResult {
                                    data: Some(data),
                                    source: DataSource::Live,
                                    late_arrival_pending: false,
                                    execution_time_ms: start.elapsed().as_secs_f64() * 1000.0,
                                    error: None,
                                    timestamp: Utc::now(),
                                }
                            }
                            _ => {
                                self.stats.lock().failures += 1;
                                ShadowRaceResult {
                                    data: None,
                                    source: DataSource::Fallback,
                                    late_arrival_pending: false,
                                    execution_time_ms: start.elapsed().as_secs_f64() * 1000.0,
                                    error: Some(format!(
                                        "Both live and cache failed: {cache_err}"
                                    )),
                                    timestamp: Utc::now(),
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Keep the losing live branch running; publish its result when it lands.
    fn detach_live(
        &self,
        live_handle: tokio::task::JoinHandle<Result<serde_json::Value>>,
        request_id: &str,
        endpoint: &str,
        started_at: DateTime<Utc>,
    ) {
        let request_id = request_id.to_string();
        let endpoint = endpoint.to_string();
        let broadcaster = self.broadcaster.clone();
        let pending = self.pending.clone();
        let stats = self.stats.clone();

        pending.lock().insert(request_id.clone(), live_handle.abort_handle());

        tokio::spawn(async move {
            match live_handle.await {
                Ok(Ok(data)) => {
                    let delay_ms = (Utc::now() - started_at).num_milliseconds().max(0) as f64;
                    stats.lock().late_arrivals += 1;
                    info!(endpoint = %endpoint, delay_ms, "Late arrival");

                    broadcaster.push(
                        "simulation_update",
                        serde_json::json!({
                            "request_id": request_id,
                            "endpoint": endpoint,
                            "data": data,
                            "delay_ms": delay_ms,
                        }),
                    );
                    broadcaster.store_late_arrival(
                        &request_id,
                        LateArrival {
                            request_id: request_id.clone(),
                            endpoint: endpoint.clone(),
                            data,
                            delay_ms,
                            arrival_time: Utc::now(),
                        },
                    );
                }
                Ok(Err(e)) => {
                    warn!(endpoint = %endpoint, error = %e, "Detached live branch failed");
                }
                Err(join_err) if join_err.is_cancelled() => {
                    info!(endpoint = %endpoint, "Detached live branch cancelled");
                }
                Err(join_err) => {
                    warn!(endpoint = %endpoint, error = %join_err, "Detached live branch panicked");
                }
            }
            pending.lock().remove(&request_id);
        });
    }

    /// Cancel a pending detached live task.
    pub fn cancel_pending(&self, request_id: &str) -> bool {
        if let Some(handle) = self.pending.lock().remove(request_id) {
            handle.abort();
            return true;
        }
        false
    }

    /// Cancel all pending detached live tasks.
    pub fn cancel_all_pending(&self) -> usize {
        let mut pending = self.pending.lock();
        let count = pending.len();
        for (_, handle) in pending.drain() {
            handle.abort();
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Counters and derived ratios for the admin surface.
    pub fn stats(&self) -> serde_json::Value {
        let stats = self.stats.lock().clone();
        let total = stats.total_requests.max(1) as f64;
        serde_json::json!({
            "total_requests": stats.total_requests,
            "cache_served": stats.cache_served,
            "live_served": stats.live_served,
            "late_arrivals": stats.late_arrivals,
            "failures": stats.failures,
            "cache_hit_rate": stats.cache_served as f64 / total * 100.0,
            "live_hit_rate": stats.live_served as f64 / total * 100.0,
            "failure_rate": stats.failures as f64 / total * 100.0,
            "pending_requests": self.pending.lock().len(),
        })
    }
}
