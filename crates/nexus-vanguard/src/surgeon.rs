//! Surgeon - remediation decisions
//!
//! Given an incident, its analysis, and the current operating mode, pick a
//! remedial action. In observer mode every decision is LOG_ONLY; otherwise
//! confidence drives the choice, with quarantine as the low-confidence
//! default and the routing table's blast-radius rules bounding what a
//! quarantine may touch.

use crate::routing_table::RoutingTable;
use crate::triage::IncidentAnalysis;
use crate::incident::Incident;
use chrono::Utc;
use nexus_common::VanguardMode;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Remedial actions, least to most invasive.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum RemediationAction {
    #[serde(rename = "LOG_ONLY")]
    LogOnly,
    #[serde(rename = "MONITOR")]
    Monitor,
    #[serde(rename = "RATE_LIMIT")]
    RateLimit,
    #[serde(rename = "QUARANTINE")]
    Quarantine,
}

impl RemediationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemediationAction::LogOnly => "LOG_ONLY",
            RemediationAction::Monitor => "MONITOR",
            RemediationAction::RateLimit => "RATE_LIMIT",
            RemediationAction::Quarantine => "QUARANTINE",
        }
    }
}

/// A recorded remediation decision.
#[derive(Debug, Clone, Serialize)]
pub struct RemediationDecision {
    pub action: RemediationAction,
    pub reason: String,
    pub confidence: u8,
    pub mode: String,
    pub endpoint: String,
    pub timestamp: chrono::DateTime<Utc>,
}

impl RemediationDecision {
    pub fn to_log_entry(&self) -> serde_json::Value {
        serde_json::json!({
            "action": self.action,
            "reason": self.reason,
            "confidence": self.confidence,
            "mode": self.mode,
            "timestamp": self.timestamp,
        })
    }
}

/// Remediation decision engine.
pub struct Surgeon {
    routing: Arc<RoutingTable>,
}

impl Surgeon {
    pub fn new(routing: Arc<RoutingTable>) -> Self {
        Surgeon { routing }
    }

    /// Select a remedial action for an incident.
    pub fn decide(
        &self,
        incident: &Incident,
        analysis: Option<&IncidentAnalysis>,
        mode: VanguardMode,
    ) -> RemediationDecision {
        let confidence = analysis.map(|a| a.confidence).unwrap_or(0);
        let ready = analysis.map(|a| a.ready_to_resolve).unwrap_or(false);

        let (action, reason) = match mode {
            VanguardMode::SilentObserver => (
                RemediationAction::LogOnly,
                "silent observer mode: logging only".to_string(),
            ),
            VanguardMode::CircuitBreaker | VanguardMode::FullSovereign => {
                if ready && confidence >= 85 {
                    (
                        RemediationAction::Monitor,
                        format!("likely already fixed (confidence {confidence}), monitoring for recurrence"),
                    )
                } else if confidence >= 85 {
                    (
                        RemediationAction::RateLimit,
                        format!("high confidence ({confidence}) but not ready: reduce endpoint traffic 50%"),
                    )
                } else if confidence >= 70 {
                    (
                        RemediationAction::RateLimit,
                        format!("cautious default at confidence {confidence}: reduce endpoint traffic 50%"),
                    )
                } else {
                    (
                        RemediationAction::Quarantine,
                        format!("low confidence ({confidence}): quarantine endpoint to its fallback"),
                    )
                }
            }
        };

        let decision = RemediationDecision {
            action,
            reason,
            confidence,
            mode: mode.as_str().to_string(),
            endpoint: incident.endpoint.clone(),
            timestamp: Utc::now(),
        };

        info!(
            endpoint = %decision.endpoint,
            action = decision.action.as_str(),
            confidence,
            "Remediation decision"
        );
        decision
    }

    /// Carry out a quarantine decision by routing the endpoint's primary
    /// handler to its fallback. Blast-radius keys refuse activation inside
    /// the table, so the surgeon can never gate health or admin surfaces.
    pub async fn apply(&self, decision: &RemediationDecision) -> bool {
        match decision.action {
            RemediationAction::Quarantine => {
                self.routing
                    .activate_fallback(&decision.endpoint, &decision.reason)
                    .await
            }
            // RATE_LIMIT is advisory metadata: the limiter shrinks the
            // endpoint's bucket on its next config refresh.
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incident::IncidentStatus;
    use chrono::Duration;
    use nexus_common::Severity;
    use std::collections::HashMap;

    fn incident() -> Incident {
        Incident {
            fingerprint: "fp".to_string(),
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            occurrence_count: 3,
            status: IncidentStatus::Active,
            severity: Severity::Red,
            endpoint: "/test".to_string(),
            error_type: "HTTPError500".to_string(),
            error_message: "boom".to_string(),
            traceback: None,
            request_id: "r1".to_string(),
            labels: HashMap::new(),
            ai_analysis: None,
            remediation_log: Vec::new(),
            audit_log: Vec::new(),
            resolved_at: None,
            resolution_summary: None,
        }
    }

    fn analysis(confidence: u8, ready: bool) -> IncidentAnalysis {
        IncidentAnalysis {
            fingerprint: "fp".to_string(),
            root_cause: "cause".to_string(),
            impact: "low".to_string(),
            recommended_fix: Vec::new(),
            ready_to_resolve: ready,
            ready_reasoning: String::new(),
            confidence,
            model_id: "m".to_string(),
            prompt_version: "v".to_string(),
            triage_source: "llm".to_string(),
            code_references: Vec::new(),
            generated_at: Utc::now(),
            expires_at: Utc::now() + Duration::hours(24),
        }
    }

    fn surgeon() -> Surgeon {
        Surgeon::new(Arc::new(RoutingTable::new()))
    }

    #[test]
    fn high_confidence_and_ready_monitors() {
        let decision = surgeon().decide(
            &incident(),
            Some(&analysis(90, true)),
            VanguardMode::CircuitBreaker,
        );
        assert_eq!(decision.action, RemediationAction::Monitor);
        assert!(decision.reason.contains("fixed"));
        assert_eq!(decision.confidence, 90);
        assert_eq!(decision.mode, "CIRCUIT_BREAKER");
    }

    #[test]
    fn high_confidence_not_ready_rate_limits() {
        let decision = surgeon().decide(
            &incident(),
            Some(&analysis(90, false)),
            VanguardMode::CircuitBreaker,
        );
        assert_eq!(decision.action, RemediationAction::RateLimit);
        assert!(decision.reason.contains("50%"));
    }

    #[test]
    fn medium_confidence_rate_limits() {
        let decision = surgeon().decide(
            &incident(),
            Some(&analysis(75, false)),
            VanguardMode::CircuitBreaker,
        );
        assert_eq!(decision.action, RemediationAction::RateLimit);
        assert!(decision.reason.contains("50%"));
    }

    #[test]
    fn low_confidence_quarantines() {
        let decision = surgeon().decide(
            &incident(),
            Some(&analysis(45, false)),
            VanguardMode::CircuitBreaker,
        );
        assert_eq!(decision.action, RemediationAction::Quarantine);
        assert!(decision.reason.contains("quarantine"));
    }

    #[test]
    fn boundary_confidences() {
        let s = surgeon();
        assert_eq!(
            s.decide(&incident(), Some(&analysis(85, true)), VanguardMode::CircuitBreaker)
                .action,
            RemediationAction::Monitor
        );
        assert_eq!(
            s.decide(&incident(), Some(&analysis(70, false)), VanguardMode::CircuitBreaker)
                .action,
            RemediationAction::RateLimit
        );
        assert_eq!(
            s.decide(&incident(), Some(&analysis(69, false)), VanguardMode::CircuitBreaker)
                .action,
            RemediationAction::Quarantine
        );
    }

    #[test]
    fn missing_analysis_defaults_to_quarantine() {
        let decision = surgeon().decide(&incident(), None, VanguardMode::CircuitBreaker);
        assert_eq!(decision.action, RemediationAction::Quarantine);
        assert_eq!(decision.confidence, 0);
    }

    #[test]
    fn silent_observer_always_logs_only() {
        let s = surgeon();
        for (confidence, ready) in [(0, false), (45, false), (85, true), (100, true)] {
            let decision = s.decide(
                &incident(),
                Some(&analysis(confidence, ready)),
                VanguardMode::SilentObserver,
            );
            assert_eq!(decision.action, RemediationAction::LogOnly);
            assert!(decision.reason.contains("silent"));
        }
    }

    #[test]
    fn decisions_carry_a_timestamp() {
        let decision = surgeon().decide(
            &incident(),
            Some(&analysis(80, false)),
            VanguardMode::CircuitBreaker,
        );
        let entry = decision.to_log_entry();
        assert!(entry["timestamp"].is_string());
        assert_eq!(entry["action"], "RATE_LIMIT");
    }

    #[tokio::test]
    async fn quarantine_cannot_touch_blast_radius() {
        let routing = Arc::new(RoutingTable::new());
        let surgeon = Surgeon::new(routing.clone());

        let mut health_incident = incident();
        health_incident.endpoint = "/health".to_string();
        let decision = surgeon.decide(&health_incident, None, VanguardMode::FullSovereign);
        assert_eq!(decision.action, RemediationAction::Quarantine);

        // The routing table refuses the activation.
        assert!(!surgeon.apply(&decision).await);
        assert!(!routing.is_fallback_active("/health"));
    }
}
