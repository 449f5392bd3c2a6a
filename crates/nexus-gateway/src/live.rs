//! Live pulse HTTP surface
//!
//! Bridges the producer's in-memory snapshot to SSE and REST clients. The
//! stream pushes only when the update cycle advances; idle clients ride on
//! keep-alive comments instead of duplicate payloads.

use crate::supervisor::Supervisor;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Json},
};
use futures::stream::{self, Stream};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

fn empty_snapshot() -> serde_json::Value {
    json!({
        "games": [],
        "leaders": [],
        "meta": {
            "timestamp": chrono::Utc::now(),
            "game_count": 0,
            "live_count": 0,
            "update_cycle": 0,
        },
        "changes": {},
    })
}

/// SSE: pulse snapshots gated by the update-cycle counter.
pub async fn live_stream(
    State(supervisor): State<Arc<Supervisor>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let tick = supervisor.config.pulse.stream_tick_secs.max(1);
    let heartbeat = supervisor.config.pulse.heartbeat_secs;

    let stream = stream::unfold(
        (supervisor, 0u64),
        move |(supervisor, last_cycle)| async move {
            loop {
                tokio::time::sleep(Duration::from_secs(tick)).await;

                let snapshot = supervisor.pulse.latest_snapshot();
                let Some(snapshot) = snapshot else {
                    continue;
                };
                let cycle = snapshot["meta"]["update_cycle"].as_u64().unwrap_or(0);
                if cycle == last_cycle {
                    // No new cycle; the keep-alive covers the silence.
                    continue;
                }

                let event = Event::default()
                    .event("pulse")
                    .data(snapshot.to_string());
                return Some((Ok(event), (supervisor, cycle)));
            }
        },
    );

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(heartbeat))
            .text("heartbeat"),
    )
}

/// REST: the full latest snapshot.
pub async fn live_games(State(supervisor): State<Arc<Supervisor>>) -> impl IntoResponse {
    match supervisor.pulse.latest_snapshot() {
        Some(snapshot) => Json(snapshot),
        None => Json(empty_snapshot()),
    }
}

/// REST: the global leaderboard slice.
pub async fn live_leaders(State(supervisor): State<Arc<Supervisor>>) -> impl IntoResponse {
    match supervisor.pulse.latest_snapshot() {
        Some(snapshot) => Json(json!({
            "leaders": snapshot["leaders"],
            "timestamp": snapshot["meta"]["timestamp"],
        })),
        None => Json(json!({
            "leaders": [],
            "message": "No live data available - waiting for first update cycle",
            "timestamp": chrono::Utc::now(),
        })),
    }
}

/// REST: producer health.
pub async fn live_status(State(supervisor): State<Arc<Supervisor>>) -> impl IntoResponse {
    let status = supervisor.pulse.status();
    let running = status["running"].as_bool().unwrap_or(false);

    Json(json!({
        "status": if running { "operational" } else { "stopped" },
        "producer": status,
        "websocket_enabled": supervisor.config.pulse.websocket_enabled,
        "timestamp": chrono::Utc::now(),
    }))
}
