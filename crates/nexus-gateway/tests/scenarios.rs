//! End-to-end scenarios over the assembled router

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use nexus_common::{NexusConfig, Result};
use nexus_gateway::{build_router, SimulationBackend, Supervisor};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn test_config() -> NexusConfig {
    let mut config = NexusConfig::default();
    config.pulse.enabled = false;
    config
}

fn supervisor() -> Arc<Supervisor> {
    let supervisor = Supervisor::new(test_config());
    supervisor.start();
    supervisor
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

fn get(path: &str, ip: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header("x-forwarded-for", ip)
        .body(Body::empty())
        .unwrap()
}

fn post_json(path: &str, ip: &str, key: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header("x-forwarded-for", ip)
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("idempotency-key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn every_response_carries_a_request_id() {
    let app = build_router(supervisor());

    let response = app
        .clone()
        .oneshot(get("/players/search?q=a", "10.1.0.1"))
        .await
        .unwrap();
    let header = response
        .headers()
        .get("x-request-id")
        .expect("request id header")
        .to_str()
        .unwrap()
        .to_string();
    assert!(uuid::Uuid::parse_str(&header).is_ok());

    // Inbound well-formed ids are adopted verbatim.
    let inbound = uuid::Uuid::new_v4().to_string();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .header("x-request-id", &inbound)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        response.headers().get("x-request-id").unwrap().to_str().unwrap(),
        inbound
    );
}

#[tokio::test]
async fn rate_limit_default_bucket_sixty_then_429() {
    let app = build_router(supervisor());

    for i in 1..=60u64 {
        let response = app
            .clone()
            .oneshot(get("/players/search?q=a", "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "request {i}");
        let remaining: u64 = response
            .headers()
            .get("x-ratelimit-remaining")
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(remaining, 60 - i);
    }

    // Request 61 trips the limiter.
    let response = app
        .clone()
        .oneshot(get("/players/search?q=a", "10.0.0.1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get("retry-after").unwrap(), "60");
    assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "0");

    // A different client is unaffected.
    let response = app
        .oneshot(get("/players/search?q=a", "10.0.0.2"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn health_surfaces_bypass_the_limiter() {
    let app = build_router(supervisor());

    for _ in 0..70 {
        let response = app.clone().oneshot(get("/healthz", "10.0.0.9")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }
}

#[tokio::test]
async fn idempotent_post_replays_and_rejects_mutated_payloads() {
    let app = build_router(supervisor());
    let body = json!({"team_a": "BOS", "team_b": "MIA", "max_players": 12});

    let first = app
        .clone()
        .oneshot(post_json("/api/h2h/populate", "10.0.1.1", Some("k1"), &body))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let first_body = body_json(first).await;
    assert_eq!(first_body["status"], "queued");

    // Byte-identical replay returns the stored response.
    let replay = app
        .clone()
        .oneshot(post_json("/api/h2h/populate", "10.0.1.1", Some("k1"), &body))
        .await
        .unwrap();
    assert_eq!(replay.status(), StatusCode::OK);
    assert_eq!(
        replay.headers().get("x-idempotency-status").unwrap(),
        "Replayed"
    );
    let replay_body = body_json(replay).await;
    assert_eq!(replay_body, first_body);

    // Same key, different payload: key reuse is rejected.
    let mutated = json!({"team_a": "LAL", "team_b": "MIA", "max_players": 12});
    let response = app
        .clone()
        .oneshot(post_json("/api/h2h/populate", "10.0.1.1", Some("k1"), &mutated))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    // Missing key is logged, not rejected.
    let response = app
        .oneshot(post_json("/api/h2h/populate", "10.0.1.1", None, &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

/// Live branch that cannot beat the patience budget.
struct SlowSimulation {
    delay_ms: u64,
}

#[async_trait]
impl SimulationBackend for SlowSimulation {
    async fn simulate(&self, player_id: &str) -> Result<Value> {
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        Ok(json!({ "player_id": player_id, "generated": "live" }))
    }

    async fn cached(&self, player_id: &str) -> Result<Value> {
        Ok(json!({ "player_id": player_id, "generated": "cache" }))
    }
}

#[tokio::test]
async fn shadow_race_serves_cache_then_publishes_the_late_arrival() {
    let supervisor = Supervisor::with_simulator(
        test_config(),
        Arc::new(SlowSimulation { delay_ms: 1200 }),
    );
    supervisor.start();
    let listener = supervisor.broadcaster.register_listener("scenario");
    let app = build_router(supervisor.clone());

    let request_id = uuid::Uuid::new_v4().to_string();
    let started = std::time::Instant::now();
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/simulate/1628389")
                .header("x-forwarded-for", "10.0.2.1")
                .header("x-request-id", &request_id)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(response.status(), StatusCode::OK);
    // Patience for /simulate is 800ms; the cache answer lands near it.
    assert!(elapsed < Duration::from_millis(1150), "took {elapsed:?}");
    let body = body_json(response).await;
    assert_eq!(body["source"], "cache");
    assert_eq!(body["late_arrival_pending"], true);
    assert_eq!(body["route"]["strategy"], "race");

    // The live branch lands later and is published as an SSE event.
    let event = tokio::time::timeout(Duration::from_secs(3), listener.recv())
        .await
        .expect("late arrival event");
    assert_eq!(event.event_type, "simulation_update");
    assert_eq!(event.data["request_id"], request_id.as_str());
    assert!(event.data["delay_ms"].as_f64().unwrap() >= 300.0);

    // One-shot polling retrieval of the same arrival.
    let response = app
        .clone()
        .oneshot(get(&format!("/simulate/late/{request_id}"), "10.0.2.1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(get(&format!("/simulate/late/{request_id}"), "10.0.2.1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn identical_failures_collapse_into_one_incident() {
    let supervisor = supervisor();
    let app = build_router(supervisor.clone());

    for ip in ["10.0.3.1", "10.0.3.2"] {
        let response = app
            .clone()
            .oneshot(get("/matchup/analyze", ip))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    // Give the capture path a beat to persist.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let response = app
        .oneshot(get("/vanguard/admin/incidents?status=active", "10.0.3.3"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["incidents"][0]["occurrence_count"], 2);

    let fingerprint = body["incidents"][0]["fingerprint"].as_str().unwrap();
    let incident = supervisor
        .vanguard
        .incidents()
        .load(fingerprint)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(incident.audit_log.len(), 2);
}

#[tokio::test]
async fn mode_override_honors_the_promotion_gate() {
    let app = build_router(supervisor());

    // Straight to FULL_SOVEREIGN is refused.
    let response = app
        .clone()
        .oneshot(post_json(
            "/vanguard/admin/mode",
            "10.0.4.1",
            Some("m1"),
            &json!({"mode": "FULL_SOVEREIGN"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    // Through CIRCUIT_BREAKER the promotion passes.
    let response = app
        .clone()
        .oneshot(post_json(
            "/vanguard/admin/mode",
            "10.0.4.1",
            Some("m2"),
            &json!({"mode": "CIRCUIT_BREAKER"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(post_json(
            "/vanguard/admin/mode",
            "10.0.4.1",
            Some("m3"),
            &json!({"mode": "FULL_SOVEREIGN"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(get("/vanguard/admin/promotion-readiness", "10.0.4.1"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert!(body["gates"].is_array());
}

#[tokio::test]
async fn admin_stats_expose_score_errors_and_counters() {
    let supervisor = supervisor();
    let app = build_router(supervisor);

    // Generate one failure first.
    app.clone()
        .oneshot(get("/matchup/analyze", "10.0.5.1"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = app
        .oneshot(get("/vanguard/admin/stats", "10.0.5.1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;

    assert_eq!(body["active_incidents"], 1);
    assert!(body["health_score"].as_f64().unwrap() <= 100.0);
    assert!(body["health_breakdown"]["incident_score"].is_number());
    assert_eq!(body["errors"]["total_errors"], 1);
    assert_eq!(body["vanguard_mode"], "SILENT_OBSERVER");
}

#[tokio::test]
async fn bulk_resolution_lands_in_the_learning_corpus() {
    let supervisor = supervisor();
    let app = build_router(supervisor.clone());

    app.clone()
        .oneshot(get("/matchup/analyze", "10.0.6.1"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let incidents = supervisor.vanguard.incidents().list(None).await.unwrap();
    let fingerprint = incidents[0].fingerprint.clone();

    let response = app
        .clone()
        .oneshot(post_json(
            "/vanguard/admin/incidents/bulk-resolve",
            "10.0.6.1",
            Some("b1"),
            &json!({"fingerprints": [fingerprint], "notes": "handler fixed"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["resolved"], 1);

    let response = app
        .oneshot(get("/vanguard/admin/learning", "10.0.6.1"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["records"][0]["notes"], "handler fixed");
    assert_eq!(body["training_payload"]["record_count"], 1);
}

#[tokio::test]
async fn live_surface_responds_while_idle() {
    let app = build_router(supervisor());

    let response = app.clone().oneshot(get("/live/games", "10.0.7.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["meta"]["update_cycle"], 0);

    let response = app.clone().oneshot(get("/live/leaders", "10.0.7.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(get("/live/status", "10.0.7.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "stopped");
}

#[tokio::test]
async fn resolve_then_unresolve_round_trips() {
    let supervisor = supervisor();
    let app = build_router(supervisor.clone());

    app.clone()
        .oneshot(get("/matchup/analyze", "10.0.8.1"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let fingerprint = supervisor.vanguard.incidents().list(None).await.unwrap()[0]
        .fingerprint
        .clone();

    // Approval is mandatory.
    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/vanguard/admin/incidents/{fingerprint}/resolve"),
            "10.0.8.1",
            Some("r1"),
            &json!({"approved": false}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/vanguard/admin/incidents/{fingerprint}/resolve"),
            "10.0.8.1",
            Some("r2"),
            &json!({"approved": true, "resolution_notes": "done"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/vanguard/admin/incidents/{fingerprint}/unresolve"),
            "10.0.8.1",
            Some("r3"),
            &json!({"approved": true, "reason": "still failing"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let incident = supervisor
        .vanguard
        .incidents()
        .load(&fingerprint)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        serde_json::to_value(incident.status).unwrap(),
        json!("active")
    );
}

#[tokio::test]
async fn limiter_fails_open_with_degraded_marker_when_store_is_down() {
    let kv = Arc::new(nexus_store::MemoryKvStore::new());
    let docs = Arc::new(nexus_store::MemoryDocumentStore::new());
    let supervisor = Supervisor::with_backends(
        test_config(),
        Arc::new(nexus_gateway::StubSimulation),
        Arc::new(nexus_gateway::OfflineScoreboard),
        kv.clone(),
        docs,
    );
    supervisor.start();
    let app = build_router(supervisor);

    kv.set_available(false);

    // Far past the bucket limit: every request passes, marked degraded.
    for _ in 0..70 {
        let response = app
            .clone()
            .oneshot(get("/players/search?q=a", "10.0.9.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("x-rate-limit-status").unwrap(),
            "degraded"
        );
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }

    // Recovery restores normal accounting.
    kv.set_available(true);
    let response = app
        .oneshot(get("/players/search?q=a", "10.0.9.1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-ratelimit-remaining").is_some());
}

#[tokio::test]
async fn idempotency_falls_back_in_process_when_store_is_down() {
    let kv = Arc::new(nexus_store::MemoryKvStore::new());
    let docs = Arc::new(nexus_store::MemoryDocumentStore::new());
    let supervisor = Supervisor::with_backends(
        test_config(),
        Arc::new(nexus_gateway::StubSimulation),
        Arc::new(nexus_gateway::OfflineScoreboard),
        kv.clone(),
        docs,
    );
    supervisor.start();
    let app = build_router(supervisor);

    kv.set_available(false);
    let body = json!({"team_a": "BOS", "team_b": "MIA", "max_players": 12});

    let first = app
        .clone()
        .oneshot(post_json("/api/h2h/populate", "10.0.10.1", Some("k9"), &body))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    // Replay still works off the container-local record.
    let replay = app
        .oneshot(post_json("/api/h2h/populate", "10.0.10.1", Some("k9"), &body))
        .await
        .unwrap();
    assert_eq!(replay.status(), StatusCode::OK);
    assert_eq!(
        replay.headers().get("x-idempotency-status").unwrap(),
        "Replayed"
    );
}

#[tokio::test]
async fn degraded_subsystem_stamps_the_system_status_header() {
    let supervisor = supervisor();
    let app = build_router(supervisor.clone());

    let response = app.clone().oneshot(get("/healthz", "10.0.11.1")).await.unwrap();
    assert!(response.headers().get("x-system-status").is_none());

    // A non-core component going down marks every response.
    supervisor
        .health_gate
        .update_component_status("pulse_producer", false);
    let response = app.oneshot(get("/healthz", "10.0.11.1")).await.unwrap();
    assert_eq!(response.headers().get("x-system-status").unwrap(), "degraded");
}
