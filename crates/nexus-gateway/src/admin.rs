//! Vanguard admin surface

use crate::handlers::{ApiError, ApiResult, LIVE_ROUTE_COUNT};
use crate::supervisor::Supervisor;
use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use nexus_common::{ErrorCode, NexusError, VanguardMode};
use nexus_vanguard::IncidentStatus;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Deserialize)]
pub struct ListParams {
    status: Option<String>,
}

pub async fn list_incidents(
    State(supervisor): State<Arc<Supervisor>>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let filter = match params.status.as_deref() {
        Some("active") => Some(IncidentStatus::Active),
        Some("resolved") => Some(IncidentStatus::Resolved),
        Some(other) => {
            return Err(NexusError::new(
                ErrorCode::InvalidParam,
                format!("unknown status filter: {other}"),
                "/vanguard/admin/incidents",
            )
            .into())
        }
        None => None,
    };

    let incidents = supervisor
        .vanguard
        .incidents()
        .list(filter)
        .await
        .map_err(ApiError)?;

    let active = incidents
        .iter()
        .filter(|i| i.status == IncidentStatus::Active)
        .count();

    Ok(Json(json!({
        "total": incidents.len(),
        "active": active,
        "resolved": incidents.len() - active,
        "incidents": incidents
            .iter()
            .map(|i| json!({
                "fingerprint": i.fingerprint,
                "endpoint": i.endpoint,
                "error_type": i.error_type,
                "status": i.status,
                "severity": i.severity,
                "occurrence_count": i.occurrence_count,
                "first_seen": i.first_seen,
                "last_seen": i.last_seen,
                "has_analysis": i.ai_analysis.is_some(),
            }))
            .collect::<Vec<_>>(),
        "timestamp": chrono::Utc::now(),
    })))
}

pub async fn get_incident(
    State(supervisor): State<Arc<Supervisor>>,
    Path(fingerprint): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let incident = supervisor
        .vanguard
        .incidents()
        .load(&fingerprint)
        .await
        .map_err(ApiError)?
        .ok_or_else(|| {
            ApiError(NexusError::new(
                ErrorCode::StatsNotFound,
                format!("incident {fingerprint} not found"),
                "/vanguard/admin/incidents",
            ))
        })?;

    Ok(Json(serde_json::to_value(&incident).unwrap_or_default()))
}

#[derive(Deserialize)]
pub struct ResolveRequest {
    #[serde(default)]
    approved: bool,
    #[serde(default)]
    resolution_notes: String,
}

pub async fn resolve_incident(
    State(supervisor): State<Arc<Supervisor>>,
    Path(fingerprint): Path<String>,
    Json(request): Json<ResolveRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if !request.approved {
        return Err(NexusError::new(
            ErrorCode::MissingParam,
            "resolution requires explicit approval: send {\"approved\": true}",
            "/vanguard/admin/incidents/resolve",
        )
        .into());
    }

    let incident = supervisor
        .vanguard
        .incidents()
        .resolve(&fingerprint, &request.resolution_notes)
        .await
        .map_err(ApiError)?;

    Ok(Json(json!({
        "success": true,
        "fingerprint": incident.fingerprint,
        "status": incident.status,
        "resolved_at": incident.resolved_at,
    })))
}

#[derive(Deserialize)]
pub struct UnresolveRequest {
    #[serde(default)]
    approved: bool,
    #[serde(default)]
    reason: String,
}

pub async fn unresolve_incident(
    State(supervisor): State<Arc<Supervisor>>,
    Path(fingerprint): Path<String>,
    Json(request): Json<UnresolveRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if !request.approved {
        return Err(NexusError::new(
            ErrorCode::MissingParam,
            "unresolve requires explicit approval: send {\"approved\": true}",
            "/vanguard/admin/incidents/unresolve",
        )
        .into());
    }

    let incident = supervisor
        .vanguard
        .incidents()
        .unresolve(&fingerprint, &request.reason)
        .await
        .map_err(ApiError)?;

    Ok(Json(json!({
        "success": true,
        "fingerprint": incident.fingerprint,
        "status": incident.status,
    })))
}

pub async fn vaccine_plan(
    State(supervisor): State<Arc<Supervisor>>,
    Path(fingerprint): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let plan = supervisor
        .vanguard
        .vaccine_plan(&fingerprint)
        .await
        .map_err(ApiError)?;
    Ok(Json(serde_json::to_value(&plan).unwrap_or_default()))
}

#[derive(Deserialize)]
pub struct BulkResolveRequest {
    fingerprints: Vec<String>,
    #[serde(default)]
    notes: String,
}

pub async fn bulk_resolve(
    State(supervisor): State<Arc<Supervisor>>,
    Json(request): Json<BulkResolveRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let resolved = supervisor
        .vanguard
        .bulk_resolve(&request.fingerprints, &request.notes)
        .await
        .map_err(ApiError)?;

    Ok(Json(json!({
        "success": true,
        "requested": request.fingerprints.len(),
        "resolved": resolved,
    })))
}

#[derive(Deserialize)]
pub struct ResolveAllRequest {
    #[serde(default)]
    confirm: bool,
    #[serde(default)]
    notes: String,
}

pub async fn resolve_all(
    State(supervisor): State<Arc<Supervisor>>,
    Json(request): Json<ResolveAllRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if !request.confirm {
        return Err(NexusError::new(
            ErrorCode::MissingParam,
            "resolve-all requires {\"confirm\": true}",
            "/vanguard/admin/incidents/resolve-all",
        )
        .into());
    }

    let resolved = supervisor
        .vanguard
        .resolve_all(&request.notes)
        .await
        .map_err(ApiError)?;
    Ok(Json(json!({ "success": true, "resolved": resolved })))
}

#[derive(Deserialize)]
pub struct AnalyzeParams {
    #[serde(default)]
    force: bool,
}

pub async fn analyze_all(
    State(supervisor): State<Arc<Supervisor>>,
    Query(params): Query<AnalyzeParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let analyzed = supervisor
        .vanguard
        .analyze_all(params.force)
        .await
        .map_err(ApiError)?;
    Ok(Json(json!({ "success": true, "analyzed": analyzed })))
}

#[derive(Deserialize)]
pub struct ModeRequest {
    mode: String,
}

pub async fn set_mode(
    State(supervisor): State<Arc<Supervisor>>,
    Json(request): Json<ModeRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let target: VanguardMode = request.mode.parse().map_err(|e: String| {
        ApiError(NexusError::new(
            ErrorCode::InvalidParam,
            e,
            "/vanguard/admin/mode",
        ))
    })?;

    let result = supervisor
        .vanguard
        .override_mode(target, LIVE_ROUTE_COUNT)
        .await
        .map_err(ApiError)?;
    Ok(Json(result))
}

pub async fn stats(
    State(supervisor): State<Arc<Supervisor>>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut stats = supervisor.vanguard.stats().await.map_err(ApiError)?;
    stats["errors"] = supervisor.errors.stats();
    stats["shadow_race"] = supervisor.shadow_race.stats();
    stats["queue"] = supervisor.queue.stats();
    stats["timestamp"] = json!(chrono::Utc::now());
    Ok(Json(stats))
}

pub async fn promotion_readiness(
    State(supervisor): State<Arc<Supervisor>>,
) -> Json<serde_json::Value> {
    Json(supervisor.vanguard.promotion_readiness(LIVE_ROUTE_COUNT).await)
}

pub async fn learning(State(supervisor): State<Arc<Supervisor>>) -> Json<serde_json::Value> {
    let ledger = supervisor.vanguard.ledger();
    Json(json!({
        "records": ledger.all(),
        "training_payload": ledger.export_training_payload(),
    }))
}

pub async fn overview(State(supervisor): State<Arc<Supervisor>>) -> Json<serde_json::Value> {
    Json(supervisor.overview())
}

pub async fn route_matrix(State(supervisor): State<Arc<Supervisor>>) -> Json<serde_json::Value> {
    Json(json!({
        "matrix": supervisor.router.route_matrix(),
        "routing_table": supervisor.vanguard.routing().all_routes(),
    }))
}
