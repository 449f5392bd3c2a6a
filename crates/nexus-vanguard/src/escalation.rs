//! Composite health scoring and autonomous mode escalation
//!
//! The composite score weighs incident load (40%), subsystem status (35%),
//! and the breadth of erroring endpoints (25%). A background loop evaluates
//! it every two minutes: below the escalation floor the mode trips to
//! circuit breaker, and once the score recovers past the ceiling the mode
//! steps back down to silent observer.

use crate::incident::{IncidentStatus, IncidentStore};
use crate::mode::ModeState;
use nexus_common::config::VanguardConfig;
use nexus_common::{Result, VanguardMode};
use nexus_store::{DocumentStore, KvStore};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

/// Boolean rollup of each subsystem, weighted for the composite score.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SubsystemFlags {
    pub registry: bool,
    pub store: bool,
    pub ai: bool,
    pub vaccine: bool,
    pub surgeon: bool,
    pub kv_store: bool,
}

impl SubsystemFlags {
    const WEIGHTS: [(&'static str, u32); 6] = [
        ("registry", 30),
        ("store", 25),
        ("ai", 20),
        ("vaccine", 15),
        ("surgeon", 5),
        ("kv_store", 5),
    ];

    fn flag(&self, name: &str) -> bool {
        match name {
            "registry" => self.registry,
            "store" => self.store,
            "ai" => self.ai,
            "vaccine" => self.vaccine,
            "surgeon" => self.surgeon,
            "kv_store" => self.kv_store,
            _ => false,
        }
    }

    /// Weighted score in [0, 100].
    pub fn score(&self) -> f64 {
        let total: u32 = Self::WEIGHTS.iter().map(|(_, w)| w).sum();
        let healthy: u32 = Self::WEIGHTS
            .iter()
            .filter(|(name, _)| self.flag(name))
            .map(|(_, w)| w)
            .sum();
        healthy as f64 / total as f64 * 100.0
    }
}

/// Composite health score with its component breakdown.
#[derive(Debug, Clone, Serialize)]
pub struct HealthScore {
    pub score: f64,
    pub incident_score: f64,
    pub subsystem_score: f64,
    pub endpoint_score: f64,
}

/// Compute the composite score from incident counts and subsystem flags.
///
/// Incident and endpoint components decay logarithmically and floor at 20;
/// the final score is clamped to [20, 100].
pub fn compute_health_score(
    active: usize,
    resolved: usize,
    erroring_endpoints: usize,
    subsystems: SubsystemFlags,
) -> HealthScore {
    let mut incident_score = if active == 0 {
        100.0
    } else {
        (100.0 - ((active as f64 + 1.0).log10() * 40.0)).max(20.0)
    };
    // Resolution ratio bonus, up to +10.
    let total = active + resolved;
    if total > 0 {
        incident_score = (incident_score + resolved as f64 / total as f64 * 10.0).min(100.0);
    }

    let subsystem_score = subsystems.score();

    let endpoint_score = if erroring_endpoints == 0 {
        100.0
    } else {
        (100.0 - ((erroring_endpoints as f64 + 1.0).log10() * 45.0)).max(20.0)
    };

    let score =
        (incident_score * 0.40 + subsystem_score * 0.35 + endpoint_score * 0.25).clamp(20.0, 100.0);

    HealthScore {
        score,
        incident_score,
        subsystem_score,
        endpoint_score,
    }
}

/// Live subsystem probe over the shared stores and config flags.
pub struct SubsystemProbe {
    kv: Arc<dyn KvStore + Send + Sync>,
    docs: Arc<dyn DocumentStore + Send + Sync>,
    engine_enabled: bool,
    llm_enabled: bool,
    vaccine_enabled: bool,
}

impl SubsystemProbe {
    pub fn new(
        kv: Arc<dyn KvStore + Send + Sync>,
        docs: Arc<dyn DocumentStore + Send + Sync>,
        config: &VanguardConfig,
    ) -> Self {
        SubsystemProbe {
            kv,
            docs,
            engine_enabled: config.enabled,
            llm_enabled: config.llm_enabled,
            vaccine_enabled: config.vaccine_enabled,
        }
    }

    pub async fn probe(&self, mode: VanguardMode) -> SubsystemFlags {
        SubsystemFlags {
            registry: self.engine_enabled,
            store: self.docs.ping().await.is_ok(),
            ai: self.llm_enabled,
            vaccine: self.vaccine_enabled,
            surgeon: matches!(
                mode,
                VanguardMode::CircuitBreaker | VanguardMode::FullSovereign
            ),
            kv_store: self.kv.ping().await.is_ok(),
        }
    }
}

/// Background loop adjusting the operating mode from the composite score.
pub struct EscalationEngine {
    incidents: Arc<IncidentStore>,
    mode: Arc<ModeState>,
    probe: Arc<SubsystemProbe>,
    interval_secs: u64,
    escalate_below: f64,
    deescalate_at: f64,
    last_score: Mutex<f64>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl EscalationEngine {
    pub fn new(
        incidents: Arc<IncidentStore>,
        mode: Arc<ModeState>,
        probe: Arc<SubsystemProbe>,
        config: &VanguardConfig,
    ) -> Arc<Self> {
        Arc::new(EscalationEngine {
            incidents,
            mode,
            probe,
            interval_secs: config.escalation_interval_secs,
            escalate_below: config.escalate_below,
            deescalate_at: config.deescalate_at,
            last_score: Mutex::new(100.0),
            handle: Mutex::new(None),
        })
    }

    /// Start the evaluation loop.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        let engine = self.clone();
        *handle = Some(tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(engine.interval_secs));
            loop {
                interval.tick().await;
                if let Err(e) = engine.check_once().await {
                    error!(error = %e, "Escalation check failed");
                }
            }
        }));
        info!("Escalation engine started");
    }

    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
            info!("Escalation engine stopped");
        }
    }

    /// One evaluation cycle: score the system, escalate or de-escalate.
    pub async fn check_once(&self) -> Result<HealthScore> {
        let score = self.current_score().await?;

        {
            let mut last = self.last_score.lock();
            if (*last - score.score).abs() > f64::EPSILON {
                info!(score = score.score, previous = *last, "Escalation check");
            }
            *last = score.score;
        }

        let mode = self.mode.get();
        if score.score < self.escalate_below {
            self.mode.set(
                VanguardMode::CircuitBreaker,
                &format!("health dropped to {:.1}", score.score),
            );
        } else if score.score >= self.deescalate_at && mode == VanguardMode::CircuitBreaker {
            self.mode.set(
                VanguardMode::SilentObserver,
                &format!("health recovered to {:.1}", score.score),
            );
        }

        Ok(score)
    }

    /// Compute the composite score without side effects.
    pub async fn current_score(&self) -> Result<HealthScore> {
        let active = self.incidents.active_count().await?;
        let resolved = self
            .incidents
            .list(Some(IncidentStatus::Resolved))
            .await?
            .len();
        let erroring = self.incidents.endpoint_hits().await?.len();
        let flags = self.probe.probe(self.mode.get()).await;

        Ok(compute_health_score(active, resolved, erroring, flags))
    }
}

impl Drop for EscalationEngine {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}
