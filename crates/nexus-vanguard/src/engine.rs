//! Vanguard engine - the incident pipeline root
//!
//! Owns the incident store, triage pipeline, surgeon, routing table,
//! hysteresis evaluator, and escalation loop, and exposes the operations the
//! gateway's middleware and admin surface call into.

use crate::anomaly::AnomalyDetector;
use crate::escalation::{EscalationEngine, SubsystemProbe};
use crate::hysteresis::HysteresisEvaluator;
use crate::incident::{map_severity, FaultReport, Incident, IncidentStatus, IncidentStore};
use crate::ledger::LearningLedger;
use crate::mode::ModeState;
use crate::promotion::{check_promotion_readiness, PromotionDeps};
use crate::routing_table::RoutingTable;
use crate::surgeon::{RemediationAction, Surgeon};
use crate::triage::{HttpLlmBackend, TriageBackend, TriagePipeline};
use crate::vaccine::{VaccinePlan, VaccinePlanEngine};
use nexus_common::config::VanguardConfig;
use nexus_common::{ErrorCode, NexusError, Priority, Result, VanguardMode};
use nexus_limits::PriorityQueue;
use nexus_registry::EndpointCategory;
use nexus_store::{DocumentStore, KvStore};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const CALIBRATION_SAMPLE_SIZE: usize = 50;

/// Root of the incident engine.
pub struct VanguardEngine {
    config: VanguardConfig,
    mode: Arc<ModeState>,
    incidents: Arc<IncidentStore>,
    triage: Arc<TriagePipeline>,
    surgeon: Surgeon,
    routing: Arc<RoutingTable>,
    hysteresis: Arc<HysteresisEvaluator>,
    escalation: Arc<EscalationEngine>,
    vaccine: VaccinePlanEngine,
    ledger: Arc<LearningLedger>,
    queue: Arc<PriorityQueue>,
    kv: Arc<dyn KvStore + Send + Sync>,
    docs: Arc<dyn DocumentStore + Send + Sync>,
    anomaly: AnomalyDetector,
    latency_samples: Mutex<HashMap<String, Vec<f64>>>,
    observation_counter: AtomicU64,
}

impl VanguardEngine {
    pub fn new(
        config: &nexus_common::NexusConfig,
        kv: Arc<dyn KvStore + Send + Sync>,
        docs: Arc<dyn DocumentStore + Send + Sync>,
        queue: Arc<PriorityQueue>,
    ) -> Arc<Self> {
        let vanguard = config.vanguard.clone();
        let mode = Arc::new(ModeState::new(vanguard.mode));
        let incidents = Arc::new(IncidentStore::new(docs.clone()));
        let routing = Arc::new(RoutingTable::new());
        let hysteresis = Arc::new(HysteresisEvaluator::new(routing.clone()));

        let backend: Option<Arc<dyn TriageBackend + Send + Sync>> = if vanguard.llm_enabled {
            Some(Arc::new(HttpLlmBackend::new(&vanguard)))
        } else {
            None
        };
        let triage = Arc::new(TriagePipeline::new(
            backend,
            routing.clone(),
            incidents.clone(),
            &vanguard,
        ));

        let probe = Arc::new(SubsystemProbe::new(kv.clone(), docs.clone(), &vanguard));
        let escalation =
            EscalationEngine::new(incidents.clone(), mode.clone(), probe, &vanguard);

        info!(mode = %mode.get(), enabled = vanguard.enabled, "VanguardEngine initialized");

        Arc::new(VanguardEngine {
            config: vanguard,
            surgeon: Surgeon::new(routing.clone()),
            mode,
            incidents,
            triage,
            routing,
            hysteresis,
            escalation,
            vaccine: VaccinePlanEngine::new(),
            ledger: Arc::new(LearningLedger::new()),
            queue,
            kv,
            docs,
            anomaly: AnomalyDetector::new(),
            latency_samples: Mutex::new(HashMap::new()),
            observation_counter: AtomicU64::new(0),
        })
    }

    /// Sampled latency observation feeding the anomaly baselines.
    ///
    /// Only the configured fraction of requests is inspected. Once enough
    /// samples accumulate for an endpoint, the baseline is recalibrated;
    /// values past the baseline's sigma bands are logged as anomalies.
    pub fn observe_latency(&self, path: &str, latency_ms: f64) {
        if !self.config.enabled || self.config.sampling_rate <= 0.0 {
            return;
        }
        let stride = (1.0 / self.config.sampling_rate).round().max(1.0) as u64;
        let n = self.observation_counter.fetch_add(1, Ordering::Relaxed);
        if n % stride != 0 {
            return;
        }

        let metric = format!("latency_ms:{path}");
        let verdict = self.anomaly.detect(&metric, latency_ms);
        if verdict.anomaly {
            warn!(
                metric = %metric,
                z_score = verdict.z_score,
                severity = verdict.severity.as_str(),
                "Latency anomaly: {}",
                verdict.evidence
            );
        }

        let observed = {
            let mut samples = self.latency_samples.lock();
            let entry = samples.entry(metric.clone()).or_default();
            entry.push(latency_ms);
            if entry.len() >= CALIBRATION_SAMPLE_SIZE {
                Some(std::mem::take(entry))
            } else {
                None
            }
        };
        if let Some(observed) = observed {
            self.anomaly
                .calibrate(&metric, &observed, self.config.analysis_ttl_hours);
        }
    }

    /// Start background loops.
    pub fn start(self: &Arc<Self>) {
        if self.config.enabled {
            self.escalation.start();
        }
    }

    pub fn shutdown(&self) {
        self.escalation.stop();
    }

    pub fn mode(&self) -> VanguardMode {
        self.mode.get()
    }

    pub fn incidents(&self) -> &Arc<IncidentStore> {
        &self.incidents
    }

    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    pub fn hysteresis(&self) -> &Arc<HysteresisEvaluator> {
        &self.hysteresis
    }

    pub fn ledger(&self) -> &Arc<LearningLedger> {
        &self.ledger
    }

    /// Capture an uncaught failure: fingerprint, upsert, schedule triage.
    ///
    /// The first occurrence of a RED incident is triaged at high priority;
    /// everything else rides the low lane.
    pub async fn capture_failure(
        self: &Arc<Self>,
        report: FaultReport,
        category: Option<EndpointCategory>,
    ) -> Result<Incident> {
        if !self.config.enabled {
            return Err(NexusError::new(
                ErrorCode::ServiceUnavailable,
                "incident engine disabled",
                &report.path,
            ));
        }

        let severity = map_severity(
            &report.error_type,
            &report.error_message,
            category,
            &report.path,
        );

        let incident = self.incidents.record_occurrence(&report, severity).await?;

        let priority = if incident.occurrence_count == 1 && severity == nexus_common::Severity::Red
        {
            Priority::High
        } else {
            Priority::Low
        };

        let engine = self.clone();
        let fingerprint = incident.fingerprint.clone();
        self.queue.submit(
            async move {
                engine.execute_triage(&fingerprint).await?;
                Ok(serde_json::json!({ "triaged": fingerprint }))
            },
            priority,
        );

        Ok(incident)
    }

    /// Triage one incident and run the remediation decision.
    pub async fn execute_triage(&self, fingerprint: &str) -> Result<()> {
        let Some(incident) = self.incidents.load(fingerprint).await? else {
            debug!(fingerprint, "Incident vanished before triage");
            return Ok(());
        };

        let analysis = self.triage.analyze(&incident, false).await?;
        let decision = self.surgeon.decide(&incident, Some(&analysis), self.mode.get());

        self.incidents
            .append_remediation(fingerprint, decision.to_log_entry())
            .await?;

        if decision.action == RemediationAction::Quarantine
            && self.mode.get() != VanguardMode::SilentObserver
        {
            self.surgeon.apply(&decision).await;
        }

        Ok(())
    }

    /// Analyze an incident on demand.
    pub async fn analyze_incident(
        &self,
        fingerprint: &str,
        force: bool,
    ) -> Result<crate::triage::IncidentAnalysis> {
        let incident = self.incidents.load(fingerprint).await?.ok_or_else(|| {
            NexusError::new(
                ErrorCode::StatsNotFound,
                format!("incident {fingerprint} not found"),
                "/vanguard/admin/incidents",
            )
        })?;
        self.triage.analyze(&incident, force).await
    }

    /// Batch triage across active incidents.
    pub async fn analyze_all(&self, force: bool) -> Result<usize> {
        self.triage.batch_analyze(force).await
    }

    /// Bulk-resolve a set of fingerprints, capturing the batch for learning.
    pub async fn bulk_resolve(&self, fingerprints: &[String], notes: &str) -> Result<usize> {
        let mut resolved = 0;
        for fingerprint in fingerprints {
            if self.incidents.resolve(fingerprint, notes).await.is_ok() {
                resolved += 1;
            }
        }
        self.ledger.capture(fingerprints.to_vec(), notes);
        info!(resolved, "Bulk resolution captured to learning ledger");
        Ok(resolved)
    }

    /// Resolve every active incident.
    pub async fn resolve_all(&self, notes: &str) -> Result<usize> {
        let active = self.incidents.list(Some(IncidentStatus::Active)).await?;
        let fingerprints: Vec<String> =
            active.iter().map(|i| i.fingerprint.clone()).collect();
        self.bulk_resolve(&fingerprints, notes).await
    }

    /// Generate a vaccine plan for one incident.
    pub async fn vaccine_plan(&self, fingerprint: &str) -> Result<VaccinePlan> {
        let incident = self.incidents.load(fingerprint).await?.ok_or_else(|| {
            NexusError::new(
                ErrorCode::StatsNotFound,
                format!("incident {fingerprint} not found"),
                "/vanguard/admin/incidents",
            )
        })?;
        Ok(self.vaccine.generate_plan(&incident))
    }

    /// Operator mode override. FULL_SOVEREIGN is promotion-gated.
    pub async fn override_mode(
        &self,
        target: VanguardMode,
        live_route_count: usize,
    ) -> Result<serde_json::Value> {
        if target == VanguardMode::FullSovereign {
            let report = self.promotion_readiness(live_route_count).await;
            if report["promotion_ready"] != true {
                warn!("FULL_SOVEREIGN promotion refused by gate");
                return Err(NexusError::new(
                    ErrorCode::ConfigurationError,
                    "promotion gates not satisfied",
                    "/vanguard/admin/mode",
                )
                .with_details(report));
            }
        }

        self.mode.set(target, "operator override");
        Ok(serde_json::json!({ "mode": target }))
    }

    pub async fn promotion_readiness(&self, live_route_count: usize) -> serde_json::Value {
        check_promotion_readiness(&PromotionDeps {
            routing: self.routing.clone(),
            hysteresis: self.hysteresis.clone(),
            mode: self.mode.clone(),
            kv: self.kv.clone(),
            docs: self.docs.clone(),
            live_route_count,
        })
        .await
    }

    /// Composite health score plus incident and subsystem breakdown.
    pub async fn stats(&self) -> Result<serde_json::Value> {
        let active = self.incidents.active_count().await?;
        let resolved = self
            .incidents
            .list(Some(IncidentStatus::Resolved))
            .await?
            .len();
        let score = self.escalation.current_score().await?;

        let hits = self.incidents.endpoint_hits().await?;
        let mut hot: Vec<(String, u64)> = hits.into_iter().collect();
        hot.sort_by(|a, b| b.1.cmp(&a.1));
        let hot_endpoints: Vec<serde_json::Value> = hot
            .into_iter()
            .take(5)
            .map(|(endpoint, count)| {
                serde_json::json!({ "endpoint": endpoint, "active_count": count })
            })
            .collect();

        Ok(serde_json::json!({
            "active_incidents": active,
            "resolved_incidents": resolved,
            "health_score": (score.score * 10.0).round() / 10.0,
            "health_breakdown": {
                "incident_score": (score.incident_score * 10.0).round() / 10.0,
                "subsystem_score": (score.subsystem_score * 10.0).round() / 10.0,
                "endpoint_score": (score.endpoint_score * 10.0).round() / 10.0,
            },
            "hot_endpoints": hot_endpoints,
            "vanguard_mode": self.mode.get(),
            "active_fallbacks": self.routing.active_fallbacks(),
        }))
    }
}
