//! Triage pipeline - AI-assisted incident analysis with heuristic fallback
//!
//! The primary path sends an anti-hallucination prompt (incident fields plus
//! source excerpts for the failing endpoint) to an LLM backend and validates
//! the strict JSON reply. The fallback path is a deterministic rule table.
//! Which path runs is decided by the routing table; an LLM timeout falls back
//! for that incident only without flipping the route.

use crate::incident::{Incident, IncidentStatus, IncidentStore};
use crate::routing_table::{RoutingTable, TRIAGE_ROUTE};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use nexus_common::config::VanguardConfig;
use nexus_common::{ErrorCode, NexusError, Result, Severity};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A file/symbol the analysis points at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeReference {
    pub file: String,
    pub symbol: String,
    pub confidence: f64,
}

/// Analysis attached to an incident, cached for 24 hours.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentAnalysis {
    pub fingerprint: String,
    pub root_cause: String,
    pub impact: String,
    pub recommended_fix: Vec<String>,
    pub ready_to_resolve: bool,
    pub ready_reasoning: String,
    /// 0-100
    pub confidence: u8,
    pub model_id: String,
    pub prompt_version: String,
    /// Which path produced this analysis: "llm" or "heuristic"
    pub triage_source: String,
    #[serde(default)]
    pub code_references: Vec<CodeReference>,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IncidentAnalysis {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// Endpoint to source-file map fed into the LLM prompt so the model cites
/// real files instead of inventing them.
pub fn endpoint_source_map() -> HashMap<&'static str, &'static str> {
    HashMap::from([
        ("/simulate", "crates/nexus-router/src/shadow_race.rs"),
        ("/matchup/analyze", "crates/nexus-router/src/adaptive_router.rs"),
        ("/confluence", "crates/nexus-router/src/adaptive_router.rs"),
        ("/players/search", "crates/nexus-gateway/src/handlers.rs"),
        ("/api/h2h/populate", "crates/nexus-gateway/src/handlers.rs"),
        ("/live", "crates/nexus-pulse/src/producer.rs"),
    ])
}

/// Backend that turns a prompt into an [`IncidentAnalysis`].
#[async_trait]
pub trait TriageBackend {
    async fn analyze(&self, incident: &Incident, prompt: &str) -> Result<IncidentAnalysis>;
}

/// HTTP LLM backend. Posts the prompt and validates the strict JSON reply;
/// anything malformed is an error and the caller falls back to heuristics.
pub struct HttpLlmBackend {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl HttpLlmBackend {
    pub fn new(config: &VanguardConfig) -> Self {
        HttpLlmBackend {
            client: reqwest::Client::new(),
            endpoint: config.llm_endpoint.clone(),
            model: config.llm_model.clone(),
        }
    }
}

#[async_trait]
impl TriageBackend for HttpLlmBackend {
    async fn analyze(&self, incident: &Incident, prompt: &str) -> Result<IncidentAnalysis> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({
                "model": self.model,
                "prompt": prompt,
            }))
            .send()
            .await
            .map_err(|e| {
                NexusError::new(ErrorCode::AiDown, format!("LLM request failed: {e}"), "triage")
            })?;

        let body: serde_json::Value = response.json().await.map_err(|e| {
            NexusError::new(
                ErrorCode::SerializationError,
                format!("LLM response unreadable: {e}"),
                "triage",
            )
        })?;

        let text = body["text"].as_str().ok_or_else(|| {
            NexusError::new(ErrorCode::SerializationError, "LLM reply missing text", "triage")
        })?;

        parse_llm_payload(text, incident, &self.model)
    }
}

/// Extract and validate the strict JSON payload from an LLM reply.
pub fn parse_llm_payload(text: &str, incident: &Incident, model_id: &str) -> Result<IncidentAnalysis> {
    let start = text.find('{');
    let end = text.rfind('}');
    let (Some(start), Some(end)) = (start, end) else {
        return Err(NexusError::new(
            ErrorCode::SerializationError,
            "LLM reply contains no JSON object",
            "triage",
        ));
    };

    let payload: serde_json::Value = serde_json::from_str(&text[start..=end])?;

    for field in [
        "root_cause",
        "impact",
        "recommended_fix",
        "ready_to_resolve",
        "ready_reasoning",
        "confidence",
    ] {
        if payload.get(field).is_none() {
            return Err(NexusError::new(
                ErrorCode::SerializationError,
                format!("LLM payload missing field: {field}"),
                "triage",
            ));
        }
    }

    let confidence = payload["confidence"]
        .as_u64()
        .filter(|c| *c <= 100)
        .ok_or_else(|| {
            NexusError::new(
                ErrorCode::SerializationError,
                "LLM confidence outside [0,100]",
                "triage",
            )
        })? as u8;

    let recommended_fix = match &payload["recommended_fix"] {
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        serde_json::Value::String(s) => vec![s.clone()],
        _ => Vec::new(),
    };

    let code_references = payload["code_references"]
        .as_array()
        .map(|refs| {
            refs.iter()
                .filter_map(|r| {
                    Some(CodeReference {
                        file: r["file"].as_str()?.to_string(),
                        symbol: r
                            .get("symbol")
                            .and_then(|s| s.as_str())
                            .unwrap_or("unknown")
                            .to_string(),
                        confidence: r["confidence"].as_f64().unwrap_or(0.6).min(1.0),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let now = Utc::now();
    Ok(IncidentAnalysis {
        fingerprint: incident.fingerprint.clone(),
        root_cause: payload["root_cause"].as_str().unwrap_or_default().to_string(),
        impact: payload["impact"].as_str().unwrap_or_default().to_string(),
        recommended_fix,
        ready_to_resolve: payload["ready_to_resolve"].as_bool().unwrap_or(false),
        ready_reasoning: payload["ready_reasoning"].as_str().unwrap_or_default().to_string(),
        confidence,
        model_id: model_id.to_string(),
        prompt_version: "triage-2.1".to_string(),
        triage_source: "llm".to_string(),
        code_references,
        generated_at: now,
        expires_at: now + Duration::hours(24),
    })
}

/// Build the anti-hallucination prompt from incident fields and the
/// endpoint source map.
pub fn build_prompt(incident: &Incident) -> String {
    let sources = endpoint_source_map();
    let source_hint = sources
        .get(incident.endpoint.as_str())
        .map(|file| format!("Handler source file: `{file}`"))
        .unwrap_or_else(|| "No source file mapped for this endpoint.".to_string());

    let traceback = incident
        .traceback
        .as_deref()
        .map(|t| {
            if t.len() > 1_500 {
                format!("{}\n... (truncated)", &t[..1_500])
            } else {
                t.to_string()
            }
        })
        .unwrap_or_else(|| "N/A".to_string());

    format!(
        "You are analyzing a production incident in a sports analytics backend.\n\
         \n\
         ## INCIDENT\n\
         - Fingerprint: {fp}\n\
         - Error type: {error_type}\n\
         - Endpoint: {endpoint}\n\
         - Occurrences: {count}\n\
         - Severity: {severity}\n\
         - First seen: {first}\n\
         - Last seen: {last}\n\
         \n\
         ## STACK TRACE\n\
         {traceback}\n\
         \n\
         ## SOURCE CONTEXT\n\
         {source_hint}\n\
         Only cite files listed above. Do not invent file names.\n\
         \n\
         ## TASK\n\
         Reply with ONLY a JSON object:\n\
         {{\"root_cause\": \"...\", \"impact\": \"...\", \"recommended_fix\": [\"...\"],\n\
          \"ready_to_resolve\": false, \"ready_reasoning\": \"...\", \"confidence\": 0}}\n\
         Set ready_to_resolve true only if the incident stopped recurring and a\n\
         fix is plausibly deployed.",
        fp = &incident.fingerprint[..16.min(incident.fingerprint.len())],
        error_type = incident.error_type,
        endpoint = incident.endpoint,
        count = incident.occurrence_count,
        severity = incident.severity.as_str(),
        first = incident.first_seen,
        last = incident.last_seen,
        traceback = traceback,
        source_hint = source_hint,
    )
}

/// Rule-table triage used when the LLM path is unavailable or rerouted.
pub fn heuristic_triage(incident: &Incident) -> IncidentAnalysis {
    let ty = incident.error_type.as_str();
    let msg = incident.error_message.to_ascii_lowercase();

    let (confidence, root_cause, fixes): (u8, &str, Vec<&str>) = if ty.contains("KeyError") {
        (
            55,
            "Schema drift: a field the handler expects is missing from the payload",
            vec![
                "Compare the payload schema against the handler's field access",
                "Add a defensive default or schema migration",
            ],
        )
    } else if ty.contains("FailedPrecondition") && msg.contains("index") {
        (
            75,
            "Store query requires a composite index that does not exist",
            vec![
                "Create the composite index named in the error message",
                "Redeploy index definitions",
            ],
        )
    } else if ty.contains("DeadlineExceeded") || msg.contains("timeout") {
        (
            65,
            "Upstream call exceeded its deadline",
            vec![
                "Check upstream latency dashboards",
                "Raise the timeout or add a cache fallback for this endpoint",
            ],
        )
    } else if ty.contains("ImportError") || ty.contains("ModuleNotFound") {
        (
            80,
            "A dependency is missing from the deployed artifact",
            vec![
                "Verify the dependency list matches the build",
                "Rebuild and redeploy the affected service",
            ],
        )
    } else if ty.contains("PermissionDenied") {
        (
            70,
            "Service identity lacks a required permission",
            vec![
                "Audit the service account's roles",
                "Grant the missing permission and retry",
            ],
        )
    } else if ty.contains("MemoryError") {
        (
            70,
            "Process exhausted its memory budget",
            vec![
                "Inspect recent payload sizes on this endpoint",
                "Bound the working set or raise the memory limit",
            ],
        )
    } else if ty.contains("Connection") || msg.contains("connection") || msg.contains("live data")
    {
        (
            60,
            "Connectivity failure reaching the live data provider",
            vec![
                "Check provider status and network egress",
                "Confirm cooldown handling engaged for the provider",
            ],
        )
    } else {
        (
            30,
            "no heuristic pattern matched",
            vec!["Inspect the stack trace and recent deploys manually"],
        )
    };

    let impact = match (incident.severity, incident.occurrence_count) {
        (Severity::Red, n) if n >= 15 => "high - sustained RED incident".to_string(),
        (Severity::Red, _) => "medium - RED incident, limited occurrences".to_string(),
        (Severity::Amber, _) => "medium - dependency degradation".to_string(),
        _ => "low".to_string(),
    };

    let now = Utc::now();
    IncidentAnalysis {
        fingerprint: incident.fingerprint.clone(),
        root_cause: root_cause.to_string(),
        impact,
        recommended_fix: fixes.into_iter().map(String::from).collect(),
        ready_to_resolve: false,
        ready_reasoning: "Heuristic triage cannot verify deployment state".to_string(),
        confidence,
        model_id: "heuristic-engine".to_string(),
        prompt_version: "heuristic-1.0".to_string(),
        triage_source: "heuristic".to_string(),
        code_references: Vec::new(),
        generated_at: now,
        expires_at: now + Duration::hours(24),
    }
}

/// Dual-path triage coordinator.
pub struct TriagePipeline {
    backend: Option<Arc<dyn TriageBackend + Send + Sync>>,
    routing: Arc<RoutingTable>,
    incidents: Arc<IncidentStore>,
    llm_timeout_secs: u64,
    analysis_ttl_hours: i64,
    batch_limit: usize,
}

impl TriagePipeline {
    pub fn new(
        backend: Option<Arc<dyn TriageBackend + Send + Sync>>,
        routing: Arc<RoutingTable>,
        incidents: Arc<IncidentStore>,
        config: &VanguardConfig,
    ) -> Self {
        TriagePipeline {
            backend,
            routing,
            incidents,
            llm_timeout_secs: config.llm_timeout_secs,
            analysis_ttl_hours: config.analysis_ttl_hours,
            batch_limit: config.batch_analysis_limit,
        }
    }

    /// Analyze one incident, honoring the analysis cache and routing table.
    pub async fn analyze(&self, incident: &Incident, force: bool) -> Result<IncidentAnalysis> {
        if !force {
            if let Some(cached) = &incident.ai_analysis {
                if !cached.is_expired() {
                    debug!(fingerprint = %incident.fingerprint, "Using cached analysis");
                    return Ok(cached.clone());
                }
            }
        }

        let mut analysis = match &self.backend {
            Some(backend) if !self.routing.is_fallback_active(TRIAGE_ROUTE) => {
                let prompt = build_prompt(incident);
                let call = backend.analyze(incident, &prompt);
                match tokio::time::timeout(
                    std::time::Duration::from_secs(self.llm_timeout_secs),
                    call,
                )
                .await
                {
                    Ok(Ok(analysis)) => analysis,
                    Ok(Err(e)) => {
                        // Fallback for this incident only; routing is untouched.
                        warn!(fingerprint = %incident.fingerprint, error = %e, "LLM triage failed, using heuristic");
                        heuristic_triage(incident)
                    }
                    Err(_) => {
                        warn!(fingerprint = %incident.fingerprint, "LLM triage timed out, using heuristic");
                        heuristic_triage(incident)
                    }
                }
            }
            _ => heuristic_triage(incident),
        };

        analysis.expires_at =
            analysis.generated_at + Duration::hours(self.analysis_ttl_hours);

        self.incidents
            .attach_analysis(&incident.fingerprint, &analysis)
            .await?;

        info!(
            fingerprint = %incident.fingerprint,
            model = %analysis.model_id,
            source = %analysis.triage_source,
            confidence = analysis.confidence,
            "Triage complete"
        );
        Ok(analysis)
    }

    /// Bounded fan-out over active incidents missing analysis.
    pub async fn batch_analyze(&self, force: bool) -> Result<usize> {
        let incidents = self.incidents.list(Some(IncidentStatus::Active)).await?;
        let mut analyzed = 0;

        for incident in incidents
            .into_iter()
            .filter(|i| {
                force
                    || i.ai_analysis.is_none()
                    || i.ai_analysis.as_ref().is_some_and(|a| a.is_expired())
            })
            .take(self.batch_limit)
        {
            self.analyze(&incident, force).await?;
            analyzed += 1;
            // Inter-request pacing keeps the LLM dependency unbothered.
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }

        info!(analyzed, "Batch analysis complete");
        Ok(analyzed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incident::{FaultReport, IncidentStore, TraceFrame};
    use nexus_common::NexusConfig;
    use nexus_store::MemoryDocumentStore;

    fn incident_with(error_type: &str, message: &str, severity: Severity, count: u64) -> Incident {
        Incident {
            fingerprint: "fp-test".to_string(),
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            occurrence_count: count,
            status: IncidentStatus::Active,
            severity,
            endpoint: "/matchup/analyze".to_string(),
            error_type: error_type.to_string(),
            error_message: message.to_string(),
            traceback: None,
            request_id: "req-1".to_string(),
            labels: HashMap::new(),
            ai_analysis: None,
            remediation_log: Vec::new(),
            audit_log: Vec::new(),
            resolved_at: None,
            resolution_summary: None,
        }
    }

    #[test]
    fn heuristic_rule_table_confidences() {
        let cases = [
            ("KeyError", "player_id", 55),
            ("FailedPrecondition", "query requires a composite index", 75),
            ("DeadlineExceeded", "deadline", 65),
            ("ImportError", "no module", 80),
            ("PermissionDenied", "denied", 70),
            ("MemoryError", "oom", 70),
            ("ConnectionError", "connection reset by peer", 60),
            ("SomethingElse", "mystery", 30),
        ];
        for (ty, msg, expected) in cases {
            let analysis = heuristic_triage(&incident_with(ty, msg, Severity::Yellow, 1));
            assert_eq!(analysis.confidence, expected, "{ty}");
            assert_eq!(analysis.model_id, "heuristic-engine");
            assert_eq!(analysis.prompt_version, "heuristic-1.0");
            assert_eq!(analysis.triage_source, "heuristic");
        }
    }

    #[test]
    fn impact_scales_with_severity_and_occurrences() {
        let high = heuristic_triage(&incident_with("KeyError", "x", Severity::Red, 20));
        assert!(high.impact.starts_with("high"));
        let low = heuristic_triage(&incident_with("KeyError", "x", Severity::Yellow, 20));
        assert_eq!(low.impact, "low");
    }

    #[test]
    fn llm_payload_parsing_is_strict() {
        let incident = incident_with("KeyError", "x", Severity::Red, 1);

        let valid = r#"Sure! {"root_cause":"missing field","impact":"simulations fail",
            "recommended_fix":["add field"],"ready_to_resolve":false,
            "ready_reasoning":"still recurring","confidence":85}"#;
        let analysis = parse_llm_payload(valid, &incident, "triage-flash").unwrap();
        assert_eq!(analysis.confidence, 85);
        assert_eq!(analysis.triage_source, "llm");

        // Missing required field rejected.
        let missing = r#"{"root_cause":"x","impact":"y"}"#;
        assert!(parse_llm_payload(missing, &incident, "m").is_err());

        // Confidence outside range rejected.
        let bad_conf = r#"{"root_cause":"x","impact":"y","recommended_fix":[],
            "ready_to_resolve":false,"ready_reasoning":"z","confidence":140}"#;
        assert!(parse_llm_payload(bad_conf, &incident, "m").is_err());

        // No JSON at all rejected.
        assert!(parse_llm_payload("I cannot analyze this.", &incident, "m").is_err());
    }

    #[tokio::test]
    async fn pipeline_uses_heuristic_when_route_fallback_active() {
        let docs = Arc::new(MemoryDocumentStore::new());
        let incidents = Arc::new(IncidentStore::new(docs));
        let routing = Arc::new(RoutingTable::new());
        routing.activate_fallback(TRIAGE_ROUTE, "test").await;

        let pipeline = TriagePipeline::new(
            None,
            routing,
            incidents.clone(),
            &NexusConfig::default().vanguard,
        );

        let report = FaultReport {
            request_id: "req-1".to_string(),
            path: "/matchup/analyze".to_string(),
            method: "POST".to_string(),
            error_type: "KeyError".to_string(),
            error_message: "player_id".to_string(),
            trace: vec![TraceFrame {
                file: "crates/nexus-gateway/src/handlers.rs".to_string(),
                line: 10,
                function: "analyze".to_string(),
            }],
        };
        let incident = incidents.record_occurrence(&report, Severity::Red).await.unwrap();

        let analysis = pipeline.analyze(&incident, false).await.unwrap();
        assert_eq!(analysis.model_id, "heuristic-engine");

        // Cached on the incident for subsequent calls.
        let reloaded = incidents.load(&incident.fingerprint).await.unwrap().unwrap();
        assert!(reloaded.ai_analysis.is_some());

        let again = pipeline.analyze(&reloaded, false).await.unwrap();
        assert_eq!(again.generated_at, analysis.generated_at);
    }

    #[tokio::test]
    async fn batch_analyze_covers_unanalyzed_incidents() {
        let docs = Arc::new(MemoryDocumentStore::new());
        let incidents = Arc::new(IncidentStore::new(docs));
        let routing = Arc::new(RoutingTable::new());

        for i in 0..3 {
            let report = FaultReport {
                request_id: format!("req-{i}"),
                path: format!("/endpoint/{i}"),
                method: "GET".to_string(),
                error_type: "KeyError".to_string(),
                error_message: "x".to_string(),
                trace: Vec::new(),
            };
            incidents.record_occurrence(&report, Severity::Yellow).await.unwrap();
        }

        let pipeline = TriagePipeline::new(
            None,
            routing,
            incidents.clone(),
            &NexusConfig::default().vanguard,
        );

        assert_eq!(pipeline.batch_analyze(false).await.unwrap(), 3);
        // Second pass finds everything cached.
        assert_eq!(pipeline.batch_analyze(false).await.unwrap(), 0);
    }
}
