//! HTTP middleware stack
//!
//! Ordering is load-bearing: request-id is assigned before anything else,
//! rate limiting runs before idempotency so denied replays consume no
//! idempotency state, idempotency runs before the handler, and incident
//! capture sits innermost so it sees handler failures but never the
//! limiter's or idempotency's own structured responses.

use crate::supervisor::Supervisor;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use nexus_common::{NexusError, RequestId};
use nexus_limits::{is_bypassed_path, IdempotencyStore, ReplayDecision};
use nexus_registry::HealthStatus;
use nexus_vanguard::FaultReport;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{debug, warn};
use uuid::Uuid;

/// Request-scoped id, stored in request extensions.
#[derive(Debug, Clone, Copy)]
pub struct RequestIdExt(pub RequestId);

const REQUEST_ID_HEADER: &str = "x-request-id";

// ---------------------------------------------------------------------------
// Request-ID propagation

/// Assigns or adopts `X-Request-ID` before anything else runs.
#[derive(Clone)]
pub struct RequestIdLayer;

impl RequestIdLayer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RequestIdLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService { inner }
    }
}

#[derive(Clone)]
pub struct RequestIdService<S> {
    inner: S,
}

impl<S> Service<Request> for RequestIdService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request) -> Self::Future {
        // Adopt a well-formed inbound id; otherwise mint a fresh v4.
        let request_id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v).ok())
            .unwrap_or_else(Uuid::new_v4);

        request.extensions_mut().insert(RequestIdExt(request_id));
        if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
            request.headers_mut().insert(REQUEST_ID_HEADER, value);
        }

        let future = self.inner.call(request);
        Box::pin(async move {
            let mut response = future.await?;
            if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
                response.headers_mut().insert(REQUEST_ID_HEADER, value);
            }
            Ok(response)
        })
    }
}

// ---------------------------------------------------------------------------
// Rate limiting

/// Token-bucket rate limiting over the shared store, failing open.
#[derive(Clone)]
pub struct RateLimitLayer {
    supervisor: Arc<Supervisor>,
}

impl RateLimitLayer {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        RateLimitLayer { supervisor }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            supervisor: self.supervisor.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    supervisor: Arc<Supervisor>,
}

impl<S> Service<Request> for RateLimitService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let supervisor = self.supervisor.clone();

        Box::pin(async move {
            let path = request.uri().path().to_string();
            let method = request.method().clone();

            if is_bypassed_path(&path) || method == axum::http::Method::OPTIONS {
                return inner.call(request).await;
            }

            let client_ip = extract_client_ip(&request);
            let bucket = supervisor.limiter.bucket_for_path(&path);

            match supervisor.limiter.check(&client_ip, bucket).await {
                // Store unreachable: fail open with the degraded marker.
                None => {
                    let mut response = inner.call(request).await?;
                    response.headers_mut().insert(
                        "x-rate-limit-status",
                        HeaderValue::from_static("degraded"),
                    );
                    Ok(response)
                }
                Some(verdict) if verdict.allowed => {
                    let mut response = inner.call(request).await?;
                    stamp_rate_headers(&mut response, verdict.limit, verdict.remaining, verdict.window_secs);
                    Ok(response)
                }
                Some(verdict) => {
                    warn!(
                        client_ip = %client_ip,
                        path = %path,
                        method = %method,
                        bucket = bucket.as_str(),
                        current = verdict.current,
                        limit = verdict.limit,
                        "rate_limit_exceeded"
                    );

                    let body = serde_json::json!({
                        "error": "Too Many Requests",
                        "retry_after": verdict.window_secs,
                        "limit": verdict.limit,
                        "window": verdict.window_secs,
                    });
                    let mut response = (
                        StatusCode::TOO_MANY_REQUESTS,
                        axum::Json(body),
                    )
                        .into_response();
                    if let Ok(value) = HeaderValue::from_str(&verdict.window_secs.to_string()) {
                        response.headers_mut().insert("retry-after", value);
                    }
                    stamp_rate_headers(&mut response, verdict.limit, 0, verdict.window_secs);
                    Ok(response)
                }
            }
        })
    }
}

fn stamp_rate_headers(response: &mut Response, limit: u64, remaining: u64, window: u64) {
    for (name, value) in [
        ("x-ratelimit-limit", limit),
        ("x-ratelimit-remaining", remaining),
        ("x-ratelimit-window", window),
    ] {
        if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
            response.headers_mut().insert(name, value);
        }
    }
}

/// Client IP resolution: X-Forwarded-For first hop, then X-Real-IP.
fn extract_client_ip(request: &Request) -> String {
    if let Some(forwarded) = request.headers().get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(first) = value.split(',').next() {
                return first.trim().to_string();
            }
        }
    }
    if let Some(real_ip) = request.headers().get("x-real-ip") {
        if let Ok(value) = real_ip.to_str() {
            return value.to_string();
        }
    }
    if let Some(info) =
        request.extensions().get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
    {
        return info.0.ip().to_string();
    }
    "unknown".to_string()
}

// ---------------------------------------------------------------------------
// Idempotency

const MAX_BUFFERED_BODY: usize = 10 * 1024 * 1024;

/// Replay-safe handling for mutating requests.
pub async fn idempotency_middleware(
    State(supervisor): State<Arc<Supervisor>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if matches!(method.as_str(), "GET" | "HEAD" | "OPTIONS") || is_bypassed_path(&path) {
        return next.run(request).await;
    }

    let Some(key) = request
        .headers()
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
    else {
        // Recommended but not required; absence is logged, not rejected.
        warn!(path = %path, method = %method, "Mutating request missing Idempotency-Key");
        return next.run(request).await;
    };

    // Buffer the body so it can be hashed and replayed downstream.
    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BUFFERED_BODY).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response()
        }
    };

    let body_hash = IdempotencyStore::body_hash(&bytes);
    let cache_key = IdempotencyStore::cache_key(&path, &key);

    match supervisor.idempotency.evaluate(&cache_key, &body_hash).await {
        ReplayDecision::PayloadMismatch => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                axum::Json(serde_json::json!({
                    "error": "Idempotency-Key reuse detected with different request payload."
                })),
            )
                .into_response();
        }
        ReplayDecision::Conflict { retry_after_secs } => {
            let mut response = (
                StatusCode::CONFLICT,
                axum::Json(serde_json::json!({
                    "error": "Concurrent request in flight or recent failure. Back off and retry."
                })),
            )
                .into_response();
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
            return response;
        }
        ReplayDecision::Replay { code, body } => {
            debug!(path = %path, "Replaying idempotent response");
            let mut response = Response::new(Body::from(body));
            *response.status_mut() =
                StatusCode::from_u16(code).unwrap_or(StatusCode::OK);
            response.headers_mut().insert(
                "content-type",
                HeaderValue::from_static("application/json"),
            );
            response
                .headers_mut()
                .insert("x-idempotency-status", HeaderValue::from_static("Replayed"));
            return response;
        }
        ReplayDecision::ReplayFingerprint { original_status } => {
            let mut response = (
                StatusCode::ACCEPTED,
                axum::Json(serde_json::json!({
                    "message": "Request previously completed via idempotency cache.",
                    "original_status": original_status,
                })),
            )
                .into_response();
            response.headers_mut().insert(
                "x-idempotency-status",
                HeaderValue::from_static("Replayed-Fingerprint"),
            );
            return response;
        }
        ReplayDecision::Proceed => {}
    }

    supervisor
        .idempotency
        .mark_in_flight(&cache_key, &body_hash)
        .await;

    let request = Request::from_parts(parts, Body::from(bytes));
    let response = next.run(request).await;

    // Snapshot the outcome. Client errors are evicted so corrections retry.
    let status = response.status();
    let (resp_parts, resp_body) = response.into_parts();
    let resp_bytes = match axum::body::to_bytes(resp_body, MAX_BUFFERED_BODY).await {
        Ok(bytes) => bytes,
        Err(_) => Default::default(),
    };

    if status.is_success() {
        let body_str = String::from_utf8_lossy(&resp_bytes);
        supervisor
            .idempotency
            .mark_completed(&cache_key, &body_hash, status.as_u16(), &body_str)
            .await;
    } else if status.is_server_error() {
        supervisor
            .idempotency
            .mark_failed(&cache_key, &body_hash, status.as_u16())
            .await;
    } else {
        supervisor.idempotency.evict(&cache_key).await;
    }

    Response::from_parts(resp_parts, Body::from(resp_bytes))
}

// ---------------------------------------------------------------------------
// Incident capture

/// Observational failure capture: any handler response carrying a
/// [`NexusError`] extension is fingerprinted into the incident engine. The
/// response itself passes through untouched.
pub async fn incident_capture_middleware(
    State(supervisor): State<Arc<Supervisor>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let method = request.method().to_string();
    let request_id = request
        .extensions()
        .get::<RequestIdExt>()
        .map(|ext| ext.0.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let started = std::time::Instant::now();
    let response = next.run(request).await;
    supervisor
        .vanguard
        .observe_latency(&path, started.elapsed().as_secs_f64() * 1000.0);

    if let Some(error) = response.extensions().get::<NexusError>() {
        supervisor.handle_error(error);

        let report = FaultReport {
            request_id,
            path: path.clone(),
            method,
            error_type: error.code.as_str().to_string(),
            error_message: error.message.clone(),
            trace: Vec::new(),
        };
        let category = supervisor.registry.get(&path).map(|e| e.category);

        // Best effort: a store hiccup must not swallow the response.
        if let Err(capture_err) = supervisor.vanguard.capture_failure(report, category).await {
            warn!(error = %capture_err, "Incident capture failed");
        }
    }

    response
}

// ---------------------------------------------------------------------------
// Degraded-status marker

/// Stamps `X-System-Status: degraded` when any non-core subsystem is down.
pub async fn degraded_status_middleware(
    State(supervisor): State<Arc<Supervisor>>,
    request: Request,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;

    let health = supervisor.health_gate.check_all();
    let non_core_down = health
        .external
        .values()
        .chain(health.components.values())
        .any(|svc| svc.status == HealthStatus::Down);

    if non_core_down {
        response.headers_mut().insert(
            "x-system-status",
            HeaderValue::from_static("degraded"),
        );
    }

    response
}
