//! Vaccine plan engine - out-of-band remediation plans
//!
//! For each incident the engine produces a structured plan: a root-cause
//! bucket, ranked fix candidates constrained to the allowed-edit roots,
//! verification and rollback steps, and a risk score. Plans always require
//! human approval.

use crate::incident::{parse_trace, Incident, ALLOWED_EDIT_ROOTS};
use chrono::Utc;
use nexus_common::Severity;
use serde::Serialize;
use tracing::info;

/// Root causes that always carry extra risk.
const HIGH_RISK_BUCKETS: &[&str] = &["infinite_loop", "iam_or_acl", "runtime_assertion"];

const MAX_FIX_CANDIDATES: usize = 5;

/// A single file/symbol identified as needing a fix.
#[derive(Debug, Clone, Serialize)]
pub struct FixCandidate {
    pub file: String,
    pub symbol: String,
    /// 0.0 - 1.0
    pub confidence: f64,
    pub reason: String,
}

/// Structured remediation plan for a single incident.
#[derive(Debug, Clone, Serialize)]
pub struct VaccinePlan {
    pub fingerprint: String,
    pub root_cause_bucket: String,
    pub fix_candidates: Vec<FixCandidate>,
    pub proposed_changes_summary: String,
    pub verification_plan: Vec<String>,
    pub rollback_plan: Vec<String>,
    /// 0.0 (safe) - 1.0 (dangerous)
    pub risk_score: f64,
    pub requires_human_approval: bool,
    pub created_at: chrono::DateTime<Utc>,
    pub incident_summary: String,
    pub ai_analysis_used: bool,
}

/// Classify an error into a root-cause bucket, by type then by any HTTP
/// status embedded in the message.
pub fn classify_root_cause(error_type: &str, error_message: &str) -> String {
    let type_buckets: &[(&str, &str)] = &[
        ("ImportError", "missing_dependency"),
        ("ModuleNotFound", "missing_dependency"),
        ("KeyError", "schema_drift"),
        ("TypeError", "type_mismatch"),
        ("ValueError", "invalid_input"),
        ("NotFound", "missing_resource"),
        ("Connection", "network_failure"),
        ("Timeout", "network_failure"),
        ("DeadlineExceeded", "network_failure"),
        ("RuntimeError", "runtime_assertion"),
        ("Assertion", "runtime_assertion"),
        ("PermissionDenied", "iam_or_acl"),
        ("Recursion", "infinite_loop"),
        ("StackOverflow", "infinite_loop"),
        ("ZeroDivision", "numeric_edge_case"),
        ("Overflow", "numeric_edge_case"),
        ("Unicode", "encoding_drift"),
        ("Utf8", "encoding_drift"),
        ("Serialization", "schema_drift"),
        ("JSON", "schema_drift"),
        ("MemoryError", "resource_exhaustion"),
    ];

    for (pattern, bucket) in type_buckets {
        if error_type.contains(pattern) {
            return bucket.to_string();
        }
    }

    let status_buckets: &[(&str, &str)] = &[
        ("404", "missing_route"),
        ("400", "validation_failure"),
        ("500", "internal_error"),
        ("422", "validation_failure"),
        ("429", "rate_limit"),
        ("503", "service_unavailable"),
    ];
    for (code, bucket) in status_buckets {
        if error_message.contains(code) {
            return bucket.to_string();
        }
    }

    "unknown".to_string()
}

/// Plan generator.
pub struct VaccinePlanEngine;

impl VaccinePlanEngine {
    pub fn new() -> Self {
        info!("VaccinePlanEngine initialized");
        VaccinePlanEngine
    }

    /// Generate a remediation plan for one incident.
    pub fn generate_plan(&self, incident: &Incident) -> VaccinePlan {
        let root_cause = classify_root_cause(&incident.error_type, &incident.error_message);
        let candidates = self.extract_candidates(incident);
        let summary = self.build_summary(incident, &candidates);
        let verification = self.build_verification_plan(incident, &candidates);
        let rollback = vec![
            "git diff --cached".to_string(),
            "git checkout -- <changed_files>".to_string(),
            "git stash".to_string(),
        ];
        let risk = self.calculate_risk(incident.severity, &candidates, &root_cause);

        VaccinePlan {
            fingerprint: incident.fingerprint.clone(),
            root_cause_bucket: root_cause,
            fix_candidates: candidates,
            proposed_changes_summary: summary,
            verification_plan: verification,
            rollback_plan: rollback,
            risk_score: risk,
            requires_human_approval: true,
            created_at: Utc::now(),
            incident_summary: format!(
                "{}: {}",
                incident.error_type,
                incident.error_message.chars().take(120).collect::<String>()
            ),
            ai_analysis_used: incident.ai_analysis.is_some(),
        }
    }

    /// Candidate ranking: stacktrace user frames (innermost first), then AI
    /// code references, then the endpoint-file map. Paths outside the
    /// allowed-edit roots are rejected at every stage.
    fn extract_candidates(&self, incident: &Incident) -> Vec<FixCandidate> {
        let mut candidates: Vec<FixCandidate> = Vec::new();
        let mut seen = std::collections::HashSet::new();

        if let Some(traceback) = &incident.traceback {
            let frames = parse_trace(traceback);
            // Innermost frames first: the root cause is at the bottom.
            let user_frames: Vec<_> = frames
                .iter()
                .rev()
                .filter(|f| f.in_allowed_roots())
                .collect();
            for frame in user_frames {
                if seen.insert(frame.file.clone()) {
                    candidates.push(FixCandidate {
                        file: frame.file.clone(),
                        symbol: format!("{}:{}", frame.function, frame.line),
                        confidence: 0.8,
                        reason: format!("stack frame at line {} in {}", frame.line, frame.function),
                    });
                }
            }
        }

        if let Some(analysis) = &incident.ai_analysis {
            for reference in &analysis.code_references {
                if is_allowed_path(&reference.file) && seen.insert(reference.file.clone()) {
                    candidates.push(FixCandidate {
                        file: reference.file.clone(),
                        symbol: reference.symbol.clone(),
                        confidence: reference.confidence.min(1.0),
                        reason: "referenced by triage analysis".to_string(),
                    });
                }
            }
        }

        if candidates.is_empty() {
            let map = crate::triage::endpoint_source_map();
            if let Some(file) = map.get(incident.endpoint.as_str()) {
                if is_allowed_path(file) {
                    candidates.push(FixCandidate {
                        file: file.to_string(),
                        symbol: "endpoint_handler".to_string(),
                        confidence: 0.4,
                        reason: format!("endpoint map: {} -> {file}", incident.endpoint),
                    });
                }
            }
        }

        candidates.truncate(MAX_FIX_CANDIDATES);
        candidates
    }

    fn build_summary(&self, incident: &Incident, candidates: &[FixCandidate]) -> String {
        let files = candidates
            .iter()
            .take(3)
            .filter_map(|c| c.file.rsplit('/').next())
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "Fix {} in {}. Error: {}",
            incident.error_type,
            if files.is_empty() { "unknown file(s)" } else { files.as_str() },
            incident.error_message.chars().take(200).collect::<String>()
        )
    }

    fn build_verification_plan(
        &self,
        incident: &Incident,
        candidates: &[FixCandidate],
    ) -> Vec<String> {
        let mut steps = vec!["cargo check --workspace".to_string()];
        if !incident.endpoint.is_empty() {
            steps.push(format!("curl -s $BASE_URL{}", incident.endpoint));
        }
        steps.push("cargo test --workspace".to_string());
        if candidates.iter().any(|c| c.file.contains("nexus-vanguard")) {
            steps.push("cargo test -p nexus-vanguard".to_string());
        }
        if candidates.iter().any(|c| c.file.contains("nexus-pulse")) {
            steps.push("curl -s $BASE_URL/live/status".to_string());
        }
        steps
    }

    /// 0.0 = safe, 1.0 = dangerous.
    fn calculate_risk(
        &self,
        severity: Severity,
        candidates: &[FixCandidate],
        root_cause: &str,
    ) -> f64 {
        let mut risk: f64 = 0.3;

        if severity == Severity::Red {
            risk += 0.2;
        }

        if !candidates.is_empty() {
            let avg_confidence: f64 =
                candidates.iter().map(|c| c.confidence).sum::<f64>() / candidates.len() as f64;
            risk += (0.4 - avg_confidence).max(0.0);
        }

        if root_cause == "unknown" {
            risk += 0.15;
        }

        if HIGH_RISK_BUCKETS.contains(&root_cause) {
            risk += 0.2;
        }

        if candidates
            .iter()
            .any(|c| c.file.contains("main") || c.file.contains("config"))
        {
            risk += 0.15;
        }

        risk.min(1.0)
    }
}

impl Default for VaccinePlanEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn is_allowed_path(path: &str) -> bool {
    let normalized = path.trim_start_matches('/').replace('\\', "/");
    ALLOWED_EDIT_ROOTS
        .iter()
        .any(|root| normalized.starts_with(root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incident::IncidentStatus;
    use crate::triage::{CodeReference, IncidentAnalysis};
    use chrono::Duration;
    use std::collections::HashMap;

    fn incident(error_type: &str, severity: Severity) -> Incident {
        Incident {
            fingerprint: "fp".to_string(),
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            occurrence_count: 1,
            status: IncidentStatus::Active,
            severity,
            endpoint: "/matchup/analyze".to_string(),
            error_type: error_type.to_string(),
            error_message: "boom".to_string(),
            traceback: Some(
                "  at crates/nexus-gateway/src/handlers.rs:120 in analyze_matchup\n  \
                 at crates/nexus-pulse/src/metrics.rs:44 in usage_rate"
                    .to_string(),
            ),
            request_id: "r1".to_string(),
            labels: HashMap::new(),
            ai_analysis: None,
            remediation_log: Vec::new(),
            audit_log: Vec::new(),
            resolved_at: None,
            resolution_summary: None,
        }
    }

    #[test]
    fn buckets_by_type_then_status() {
        assert_eq!(classify_root_cause("KeyError", ""), "schema_drift");
        assert_eq!(classify_root_cause("ConnectionError", ""), "network_failure");
        assert_eq!(classify_root_cause("PermissionDenied", ""), "iam_or_acl");
        assert_eq!(classify_root_cause("Unexpected", "HTTP 429 from host"), "rate_limit");
        assert_eq!(classify_root_cause("Unexpected", "nothing useful"), "unknown");
    }

    #[test]
    fn candidates_come_from_trace_innermost_first() {
        let plan = VaccinePlanEngine::new().generate_plan(&incident("KeyError", Severity::Yellow));
        assert_eq!(plan.fix_candidates.len(), 2);
        // Innermost frame leads.
        assert_eq!(plan.fix_candidates[0].file, "crates/nexus-pulse/src/metrics.rs");
        assert_eq!(plan.fix_candidates[0].confidence, 0.8);
        assert!(plan.requires_human_approval);
    }

    #[test]
    fn candidates_outside_allowed_roots_are_rejected() {
        let mut incident = incident("KeyError", Severity::Yellow);
        incident.traceback =
            Some("  at /usr/lib/libstd.rs:1 in panic\n  at vendor/thing.rs:2 in call".to_string());
        incident.ai_analysis = Some(IncidentAnalysis {
            fingerprint: "fp".to_string(),
            root_cause: String::new(),
            impact: String::new(),
            recommended_fix: Vec::new(),
            ready_to_resolve: false,
            ready_reasoning: String::new(),
            confidence: 60,
            model_id: "m".to_string(),
            prompt_version: "v".to_string(),
            triage_source: "llm".to_string(),
            code_references: vec![CodeReference {
                file: "/etc/passwd".to_string(),
                symbol: "nope".to_string(),
                confidence: 0.9,
            }],
            generated_at: Utc::now(),
            expires_at: Utc::now() + Duration::hours(24),
        });

        let plan = VaccinePlanEngine::new().generate_plan(&incident);
        // Falls through to the endpoint map, which is in allowed roots.
        assert_eq!(plan.fix_candidates.len(), 1);
        assert_eq!(plan.fix_candidates[0].confidence, 0.4);
        assert!(plan.fix_candidates[0].file.starts_with("crates/"));
    }

    #[test]
    fn risk_composes_severity_confidence_and_bucket() {
        let engine = VaccinePlanEngine::new();

        // RED + trace candidates (0.8 conf): 0.3 + 0.2 = 0.5
        let red = engine.generate_plan(&incident("KeyError", Severity::Red));
        assert!((red.risk_score - 0.5).abs() < 1e-9);

        // High-risk bucket adds 0.2.
        let risky = engine.generate_plan(&incident("PermissionDenied", Severity::Red));
        assert!((risky.risk_score - 0.7).abs() < 1e-9);

        // Unknown bucket with no trace: 0.3 + 0.15 + (0.4-0.4 map conf=0.4 -> 0.0)...
        let mut unknown = incident("Mystery", Severity::Yellow);
        unknown.traceback = None;
        let plan = engine.generate_plan(&unknown);
        assert!(plan.risk_score <= 1.0 && plan.risk_score >= 0.3);
    }

    #[test]
    fn risk_clamps_at_one() {
        let mut worst = incident("RecursionError", Severity::Red);
        worst.traceback = Some("  at crates/nexus-gateway/src/main.rs:1 in main".to_string());
        // Force low-confidence candidates via analysis refs only.
        let plan = VaccinePlanEngine::new().generate_plan(&worst);
        assert!(plan.risk_score <= 1.0);
    }

    #[test]
    fn verification_plan_includes_endpoint_smoke() {
        let plan = VaccinePlanEngine::new().generate_plan(&incident("KeyError", Severity::Yellow));
        assert!(plan
            .verification_plan
            .iter()
            .any(|s| s.contains("/matchup/analyze")));
        assert!(plan.verification_plan.iter().any(|s| s.contains("cargo check")));
    }
}
