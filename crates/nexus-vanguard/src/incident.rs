//! Incident model, fingerprinting, and persistent store
//!
//! Structurally identical failures collapse into one incident: the
//! fingerprint hashes the normalized path, the error type, and the deepest
//! stack frame inside the allowed-edit roots. Occurrences of a known
//! fingerprint bump the counter and the audit log; they never create a new
//! record.

use crate::triage::IncidentAnalysis;
use chrono::{DateTime, Utc};
use nexus_common::{ErrorCode, NexusError, Result, Severity};
use nexus_registry::EndpointCategory;
use nexus_store::DocumentStore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Collection names in the document store.
pub const INCIDENTS_COLLECTION: &str = "incidents";
pub const ANALYSIS_COLLECTION: &str = "vanguard_analysis";

/// Roots under which automated fixes may touch files. Frames outside these
/// never become the fingerprint anchor or a fix candidate.
pub const ALLOWED_EDIT_ROOTS: &[&str] = &["crates/", "scripts/"];

/// One frame of a captured stack trace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraceFrame {
    pub file: String,
    pub line: u32,
    pub function: String,
}

impl TraceFrame {
    pub fn in_allowed_roots(&self) -> bool {
        let normalized = self.file.trim_start_matches('/').replace('\\', "/");
        ALLOWED_EDIT_ROOTS
            .iter()
            .any(|root| normalized.starts_with(root))
    }
}

/// Raw failure captured by the incident middleware.
#[derive(Debug, Clone)]
pub struct FaultReport {
    pub request_id: String,
    pub path: String,
    pub method: String,
    pub error_type: String,
    pub error_message: String,
    pub trace: Vec<TraceFrame>,
}

/// Persistent incident record, keyed by fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub fingerprint: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrence_count: u64,
    pub status: IncidentStatus,
    pub severity: Severity,
    pub endpoint: String,
    pub error_type: String,
    pub error_message: String,
    pub traceback: Option<String>,
    pub request_id: String,
    pub labels: HashMap<String, String>,
    pub ai_analysis: Option<IncidentAnalysis>,
    pub remediation_log: Vec<serde_json::Value>,
    /// One entry per observed occurrence.
    pub audit_log: Vec<serde_json::Value>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_summary: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Active,
    Resolved,
}

/// Replace volatile path segments so structurally identical failures match.
/// Numeric ids become `{id}`, UUID-shaped segments become `{uuid}`.
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if !segment.is_empty() && segment.chars().all(|c| c.is_ascii_digit()) {
                "{id}"
            } else if looks_like_uuid(segment) {
                "{uuid}"
            } else {
                segment
            }
        })
        .collect::<Vec<&str>>()
        .join("/")
}

fn looks_like_uuid(segment: &str) -> bool {
    segment.len() == 36
        && segment.chars().enumerate().all(|(i, c)| match i {
            8 | 13 | 18 | 23 => c == '-',
            _ => c.is_ascii_hexdigit(),
        })
}

/// Deepest frame whose file lies in the allowed-edit roots.
pub fn top_user_frame(trace: &[TraceFrame]) -> Option<&TraceFrame> {
    trace.iter().rev().find(|frame| frame.in_allowed_roots())
}

/// Stable hash identifying a class of failures.
pub fn compute_fingerprint(path: &str, error_type: &str, trace: &[TraceFrame]) -> String {
    let anchor = top_user_frame(trace)
        .map(|frame| format!("{}:{}", frame.file, frame.function))
        .unwrap_or_else(|| "no-user-frame".to_string());

    let mut hasher = Sha256::new();
    hasher.update(normalize_path(path).as_bytes());
    hasher.update(b"|");
    hasher.update(error_type.as_bytes());
    hasher.update(b"|");
    hasher.update(anchor.as_bytes());
    hex::encode(hasher.finalize())
}

/// Map a failure to incident severity.
pub fn map_severity(
    error_type: &str,
    message: &str,
    category: Option<EndpointCategory>,
    path: &str,
) -> Severity {
    let msg = message.to_ascii_lowercase();
    let ty = error_type.to_ascii_lowercase();

    // Admin diagnostics are informational by construction.
    if path.starts_with("/vanguard/admin") || matches!(category, Some(EndpointCategory::Admin)) {
        return Severity::Green;
    }

    // Dependency connectivity problems.
    if ty.contains("timeout")
        || ty.contains("connection")
        || msg.contains("timeout")
        || msg.contains("connection refused")
        || msg.contains("unreachable")
    {
        return Severity::Amber;
    }

    // Validation failures inside analytical endpoints.
    let is_validation = ty.contains("validation")
        || ty.contains("invalid")
        || msg.contains("invalid")
        || msg.contains("missing");
    if is_validation
        && matches!(
            category,
            Some(EndpointCategory::Simulation) | Some(EndpointCategory::Analysis)
        )
    {
        return Severity::Yellow;
    }

    Severity::Red
}

/// Incident persistence over the document store.
///
/// The upsert path serializes through one async mutex: the read-modify-write
/// against the store must not interleave, and no parking-lot guard may be
/// held across the store awaits.
pub struct IncidentStore {
    docs: Arc<dyn DocumentStore + Send + Sync>,
    upsert_lock: tokio::sync::Mutex<()>,
}

impl IncidentStore {
    pub fn new(docs: Arc<dyn DocumentStore + Send + Sync>) -> Self {
        IncidentStore {
            docs,
            upsert_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Record an occurrence: create the incident or bump the existing one.
    pub async fn record_occurrence(
        &self,
        report: &FaultReport,
        severity: Severity,
    ) -> Result<Incident> {
        let fingerprint = compute_fingerprint(&report.path, &report.error_type, &report.trace);
        let _guard = self.upsert_lock.lock().await;

        let now = Utc::now();
        let audit_entry = serde_json::json!({
            "request_id": report.request_id,
            "at": now,
        });

        let incident = match self.load(&fingerprint).await? {
            Some(mut existing) => {
                existing.occurrence_count += 1;
                existing.last_seen = now;
                existing.request_id = report.request_id.clone();
                existing.error_message = report.error_message.clone();
                existing.audit_log.push(audit_entry);
                if existing.severity < severity {
                    existing.severity = severity;
                }
                existing
            }
            None => {
                info!(fingerprint = %fingerprint, endpoint = %report.path, "New incident");
                Incident {
                    fingerprint: fingerprint.clone(),
                    first_seen: now,
                    last_seen: now,
                    occurrence_count: 1,
                    status: IncidentStatus::Active,
                    severity,
                    endpoint: normalize_path(&report.path),
                    error_type: report.error_type.clone(),
                    error_message: report.error_message.clone(),
                    traceback: format_trace(&report.trace),
                    request_id: report.request_id.clone(),
                    labels: HashMap::new(),
                    ai_analysis: None,
                    remediation_log: Vec::new(),
                    audit_log: vec![audit_entry],
                    resolved_at: None,
                    resolution_summary: None,
                }
            }
        };

        self.save(&incident).await?;
        Ok(incident)
    }

    pub async fn load(&self, fingerprint: &str) -> Result<Option<Incident>> {
        match self.docs.get(INCIDENTS_COLLECTION, fingerprint).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    pub async fn save(&self, incident: &Incident) -> Result<()> {
        self.docs
            .upsert(
                INCIDENTS_COLLECTION,
                &incident.fingerprint,
                serde_json::to_value(incident)?,
            )
            .await
    }

    /// All incidents, optionally filtered by status.
    pub async fn list(&self, status: Option<IncidentStatus>) -> Result<Vec<Incident>> {
        let mut incidents = Vec::new();
        for id in self.docs.list_ids(INCIDENTS_COLLECTION).await? {
            if let Some(incident) = self.load(&id).await? {
                if status.is_none() || status == Some(incident.status) {
                    incidents.push(incident);
                }
            }
        }
        incidents.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(incidents)
    }

    pub async fn active_count(&self) -> Result<usize> {
        Ok(self.list(Some(IncidentStatus::Active)).await?.len())
    }

    /// Resolve an incident, snapshotting any prior analysis.
    pub async fn resolve(&self, fingerprint: &str, notes: &str) -> Result<Incident> {
        let mut incident = self.load(fingerprint).await?.ok_or_else(|| {
            NexusError::new(
                ErrorCode::StatsNotFound,
                format!("incident {fingerprint} not found"),
                "/vanguard/admin/incidents",
            )
        })?;

        if incident.status == IncidentStatus::Resolved {
            return Ok(incident);
        }

        let now = Utc::now();
        incident.status = IncidentStatus::Resolved;
        incident.resolved_at = Some(now);
        incident.resolution_summary = Some(serde_json::json!({
            "notes": notes,
            "resolved_at": now,
            "occurrence_count": incident.occurrence_count,
            "pre_resolution_analysis": incident.ai_analysis,
        }));

        self.save(&incident).await?;
        info!(fingerprint, "Incident resolved");
        Ok(incident)
    }

    /// Revert a resolution, restoring the incident to active.
    pub async fn unresolve(&self, fingerprint: &str, reason: &str) -> Result<Incident> {
        let mut incident = self.load(fingerprint).await?.ok_or_else(|| {
            NexusError::new(
                ErrorCode::StatsNotFound,
                format!("incident {fingerprint} not found"),
                "/vanguard/admin/incidents",
            )
        })?;

        if incident.status == IncidentStatus::Active {
            return Ok(incident);
        }

        incident.status = IncidentStatus::Active;
        incident.resolved_at = None;
        incident.resolution_summary = None;
        incident.audit_log.push(serde_json::json!({
            "unresolved_at": Utc::now(),
            "reason": reason,
        }));

        self.save(&incident).await?;
        warn!(fingerprint, reason, "Incident reverted to active");
        Ok(incident)
    }

    /// Attach an analysis to the incident and the analysis collection.
    pub async fn attach_analysis(
        &self,
        fingerprint: &str,
        analysis: &IncidentAnalysis,
    ) -> Result<()> {
        if let Some(mut incident) = self.load(fingerprint).await? {
            incident.ai_analysis = Some(analysis.clone());
            self.save(&incident).await?;
        }
        self.docs
            .upsert(
                ANALYSIS_COLLECTION,
                fingerprint,
                serde_json::to_value(analysis)?,
            )
            .await
    }

    /// Append a remediation decision to the incident's log.
    pub async fn append_remediation(
        &self,
        fingerprint: &str,
        decision: serde_json::Value,
    ) -> Result<()> {
        if let Some(mut incident) = self.load(fingerprint).await? {
            incident.remediation_log.push(decision);
            self.save(&incident).await?;
        }
        Ok(())
    }

    /// Count of active occurrences per endpoint, for the composite score.
    pub async fn endpoint_hits(&self) -> Result<HashMap<String, u64>> {
        let mut hits = HashMap::new();
        for incident in self.list(Some(IncidentStatus::Active)).await? {
            *hits.entry(incident.endpoint.clone()).or_insert(0) += incident.occurrence_count;
        }
        Ok(hits)
    }
}

fn format_trace(trace: &[TraceFrame]) -> Option<String> {
    if trace.is_empty() {
        return None;
    }
    Some(
        trace
            .iter()
            .map(|f| format!("  at {}:{} in {}", f.file, f.line, f.function))
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

/// Parse a formatted traceback back into frames.
pub fn parse_trace(traceback: &str) -> Vec<TraceFrame> {
    traceback
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let rest = line.strip_prefix("at ")?;
            let (location, function) = rest.split_once(" in ")?;
            let (file, line_no) = location.rsplit_once(':')?;
            Some(TraceFrame {
                file: file.to_string(),
                line: line_no.parse().ok()?,
                function: function.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_store::MemoryDocumentStore;

    fn frames() -> Vec<TraceFrame> {
        vec![
            TraceFrame {
                file: "crates/nexus-gateway/src/handlers.rs".to_string(),
                line: 120,
                function: "analyze_matchup".to_string(),
            },
            TraceFrame {
                file: "crates/nexus-pulse/src/metrics.rs".to_string(),
                line: 44,
                function: "usage_rate".to_string(),
            },
            TraceFrame {
                file: "/usr/lib/libstd.rs".to_string(),
                line: 1,
                function: "panic".to_string(),
            },
        ]
    }

    fn report(request_id: &str, path: &str) -> FaultReport {
        FaultReport {
            request_id: request_id.to_string(),
            path: path.to_string(),
            method: "GET".to_string(),
            error_type: "KeyError".to_string(),
            error_message: "player_id".to_string(),
            trace: frames(),
        }
    }

    #[test]
    fn normalize_replaces_ids_and_uuids() {
        assert_eq!(normalize_path("/simulate/1628389"), "/simulate/{id}");
        assert_eq!(
            normalize_path("/jobs/8b33a9c2-45a1-4c0e-9f7a-2d11c77b10aa/status"),
            "/jobs/{uuid}/status"
        );
        assert_eq!(normalize_path("/players/search"), "/players/search");
    }

    #[test]
    fn top_user_frame_skips_system_frames() {
        let trace = frames();
        let frame = top_user_frame(&trace).unwrap();
        assert_eq!(frame.function, "usage_rate");
    }

    #[test]
    fn fingerprint_is_stable_across_volatile_segments() {
        let a = compute_fingerprint("/simulate/1628389", "KeyError", &frames());
        let b = compute_fingerprint("/simulate/201939", "KeyError", &frames());
        let c = compute_fingerprint("/simulate/1628389", "TypeError", &frames());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn severity_mapping_follows_the_taxonomy() {
        assert_eq!(
            map_severity("ConnectionError", "connection refused", None, "/simulate"),
            Severity::Amber
        );
        assert_eq!(
            map_severity(
                "ValidationError",
                "invalid player",
                Some(EndpointCategory::Simulation),
                "/simulate"
            ),
            Severity::Yellow
        );
        assert_eq!(
            map_severity("Panic", "index out of bounds", None, "/simulate"),
            Severity::Red
        );
        assert_eq!(
            map_severity("Panic", "whatever", Some(EndpointCategory::Admin), "/vanguard/admin/stats"),
            Severity::Green
        );
    }

    #[tokio::test]
    async fn identical_failures_collapse_into_one_incident() {
        let store = IncidentStore::new(Arc::new(MemoryDocumentStore::new()));

        let first = store
            .record_occurrence(&report("req-1", "/matchup/analyze"), Severity::Red)
            .await
            .unwrap();
        let second = store
            .record_occurrence(&report("req-2", "/matchup/analyze"), Severity::Red)
            .await
            .unwrap();

        assert_eq!(first.fingerprint, second.fingerprint);
        assert_eq!(second.occurrence_count, 2);
        assert_eq!(second.audit_log.len(), 2);
        assert_eq!(second.first_seen, first.first_seen);
        assert_eq!(store.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resolve_snapshots_and_unresolve_reverts() {
        let store = IncidentStore::new(Arc::new(MemoryDocumentStore::new()));
        let incident = store
            .record_occurrence(&report("req-1", "/matchup/analyze"), Severity::Red)
            .await
            .unwrap();

        let resolved = store.resolve(&incident.fingerprint, "fixed upstream").await.unwrap();
        assert_eq!(resolved.status, IncidentStatus::Resolved);
        assert!(resolved.resolved_at.is_some());
        let summary = resolved.resolution_summary.as_ref().unwrap();
        assert_eq!(summary["notes"], "fixed upstream");

        let reverted = store
            .unresolve(&incident.fingerprint, "regressed in prod")
            .await
            .unwrap();
        assert_eq!(reverted.status, IncidentStatus::Active);
        assert!(reverted.resolution_summary.is_none());
        assert_eq!(store.active_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn endpoint_hits_aggregates_active_occurrences() {
        let store = IncidentStore::new(Arc::new(MemoryDocumentStore::new()));
        store
            .record_occurrence(&report("r1", "/matchup/analyze"), Severity::Red)
            .await
            .unwrap();
        store
            .record_occurrence(&report("r2", "/matchup/analyze"), Severity::Red)
            .await
            .unwrap();

        let hits = store.endpoint_hits().await.unwrap();
        assert_eq!(hits["/matchup/analyze"], 2);
    }

    #[test]
    fn trace_round_trips_through_formatting() {
        let trace = frames();
        let formatted = format_trace(&trace).unwrap();
        let parsed = parse_trace(&formatted);
        assert_eq!(parsed, trace);
    }
}
