//! Hysteresis-driven degradation for the AI triage dependency
//!
//! Three consecutive unhealthy checks flip triage to its heuristic fallback;
//! two consecutive healthy checks restore the primary. Evaluation is skipped
//! entirely in circuit-breaker mode, where a human owns the routing.

use crate::routing_table::{RoutingTable, TRIAGE_ROUTE};
use nexus_common::VanguardMode;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

const FAILURES_TO_ACTIVATE: u32 = 3;
const SUCCESSES_TO_DEACTIVATE: u32 = 2;

#[derive(Debug, Default, Clone, Copy)]
pub struct HysteresisCounters {
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

/// Consecutive-check evaluator over the triage route.
pub struct HysteresisEvaluator {
    routing: Arc<RoutingTable>,
    counters: Mutex<HysteresisCounters>,
}

impl HysteresisEvaluator {
    pub fn new(routing: Arc<RoutingTable>) -> Self {
        HysteresisEvaluator {
            routing,
            counters: Mutex::new(HysteresisCounters::default()),
        }
    }

    /// Feed one health check result. Returns true if the routing changed.
    pub async fn record_check(&self, healthy: bool, mode: VanguardMode) -> bool {
        // Human is in control of the mode; routing is steady.
        if mode == VanguardMode::CircuitBreaker {
            debug!("Hysteresis evaluation skipped in circuit-breaker mode");
            return false;
        }

        let (should_activate, should_deactivate) = {
            let mut counters = self.counters.lock();
            if healthy {
                counters.consecutive_successes += 1;
                counters.consecutive_failures = 0;
            } else {
                counters.consecutive_failures += 1;
                counters.consecutive_successes = 0;
            }
            (
                counters.consecutive_failures >= FAILURES_TO_ACTIVATE,
                counters.consecutive_successes >= SUCCESSES_TO_DEACTIVATE,
            )
        };

        if should_activate && !self.routing.is_fallback_active(TRIAGE_ROUTE) {
            return self
                .routing
                .activate_fallback(
                    TRIAGE_ROUTE,
                    &format!("{FAILURES_TO_ACTIVATE} consecutive unhealthy triage checks"),
                )
                .await;
        }

        if should_deactivate && self.routing.is_fallback_active(TRIAGE_ROUTE) {
            return self.routing.deactivate_fallback(TRIAGE_ROUTE).await.is_some();
        }

        false
    }

    pub fn counters(&self) -> HysteresisCounters {
        *self.counters.lock()
    }
}
