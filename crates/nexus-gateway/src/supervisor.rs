//! Supervisor - lifecycle root for the whole control plane
//!
//! Owns every one-per-process component, starts them at boot, and shuts them
//! down in LIFO order. Tests construct fresh supervisors instead of
//! resetting globals.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nexus_common::{ErrorCode, ErrorLog, NexusConfig, NexusError, Result};
use nexus_limits::{IdempotencyStore, PriorityQueue, RateLimiter};
use nexus_pulse::{
    BoxScore, GameSummary, PulseProducer, SportsApi, StoreBaselines,
};
use nexus_registry::{EndpointRegistry, HealthGate};
use nexus_router::{AdaptiveRouter, ShadowRace, SseBroadcaster};
use nexus_store::{create_document_store, create_kv_store, DocumentStore, KvStore};
use nexus_vanguard::VanguardEngine;
use std::sync::Arc;
use tracing::info;

/// Simulation/analysis engines are external collaborators; the supervisor
/// invokes them through this seam.
#[async_trait]
pub trait SimulationBackend {
    /// Run a live simulation for a player.
    async fn simulate(&self, player_id: &str) -> Result<serde_json::Value>;

    /// Return the cached projection for a player.
    async fn cached(&self, player_id: &str) -> Result<serde_json::Value>;
}

/// Default backend: instant canned projections. Deployments wire the real
/// engines in through [`Supervisor::with_simulator`].
pub struct StubSimulation;

#[async_trait]
impl SimulationBackend for StubSimulation {
    async fn simulate(&self, player_id: &str) -> Result<serde_json::Value> {
        Ok(serde_json::json!({
            "player_id": player_id,
            "projection": { "pts": 24.5, "reb": 6.1, "ast": 5.2 },
            "generated": "live",
        }))
    }

    async fn cached(&self, player_id: &str) -> Result<serde_json::Value> {
        Ok(serde_json::json!({
            "player_id": player_id,
            "projection": { "pts": 23.0, "reb": 6.0, "ast": 5.0 },
            "generated": "cache",
        }))
    }
}

/// Sports API stand-in used until a provider client is wired in: an empty
/// scoreboard keeps the pulse loop idle but healthy.
pub struct OfflineScoreboard;

#[async_trait]
impl SportsApi for OfflineScoreboard {
    async fn fetch_scoreboard(&self) -> Result<Vec<GameSummary>> {
        Ok(Vec::new())
    }

    async fn fetch_boxscore(&self, game_id: &str) -> Result<BoxScore> {
        Err(NexusError::new(
            ErrorCode::GameNotFound,
            format!("no live boxscore for {game_id}"),
            "/live",
        ))
    }
}

/// Root supervisor owning all one-per-process components.
pub struct Supervisor {
    pub config: NexusConfig,
    pub kv: Arc<dyn KvStore + Send + Sync>,
    pub docs: Arc<dyn DocumentStore + Send + Sync>,
    pub registry: Arc<EndpointRegistry>,
    pub health_gate: Arc<HealthGate>,
    pub broadcaster: Arc<SseBroadcaster>,
    pub shadow_race: Arc<ShadowRace>,
    pub router: Arc<AdaptiveRouter>,
    pub queue: Arc<PriorityQueue>,
    pub limiter: Arc<RateLimiter>,
    pub idempotency: Arc<IdempotencyStore>,
    pub vanguard: Arc<VanguardEngine>,
    pub pulse: Arc<PulseProducer>,
    pub errors: Arc<ErrorLog>,
    pub simulator: Arc<dyn SimulationBackend + Send + Sync>,
    started_at: DateTime<Utc>,
}

impl Supervisor {
    /// Build the full component tree with default backends.
    pub fn new(config: NexusConfig) -> Arc<Self> {
        Self::build(
            config,
            Arc::new(StubSimulation),
            Arc::new(OfflineScoreboard),
        )
    }

    /// Build with a custom simulation backend (tests, real engines).
    pub fn with_simulator(
        config: NexusConfig,
        simulator: Arc<dyn SimulationBackend + Send + Sync>,
    ) -> Arc<Self> {
        Self::build(config, simulator, Arc::new(OfflineScoreboard))
    }

    pub fn build(
        config: NexusConfig,
        simulator: Arc<dyn SimulationBackend + Send + Sync>,
        sports_api: Arc<dyn SportsApi + Send + Sync>,
    ) -> Arc<Self> {
        let kv = create_kv_store(&config);
        let docs = create_document_store(&config);
        Self::with_backends(config, simulator, sports_api, kv, docs)
    }

    /// Build against externally owned store backends (tests, embedding).
    pub fn with_backends(
        config: NexusConfig,
        simulator: Arc<dyn SimulationBackend + Send + Sync>,
        sports_api: Arc<dyn SportsApi + Send + Sync>,
        kv: Arc<dyn KvStore + Send + Sync>,
        docs: Arc<dyn DocumentStore + Send + Sync>,
    ) -> Arc<Self> {
        info!("Initializing Nexus supervisor");

        let registry = Arc::new(EndpointRegistry::default());
        let health_gate = Arc::new(HealthGate::new());
        let broadcaster = Arc::new(SseBroadcaster::new(
            config.router.listener_queue_capacity,
            config.router.late_arrival_ttl_secs,
        ));
        let shadow_race = Arc::new(ShadowRace::new(
            broadcaster.clone(),
            config.router.last_resort_wait_ms,
        ));
        let router = Arc::new(AdaptiveRouter::new(
            registry.clone(),
            health_gate.clone(),
            config.router.default_patience_ms,
            config.router.default_buffer_ms,
        ));
        let queue = Arc::new(PriorityQueue::new(&config));
        let limiter = Arc::new(RateLimiter::new(kv.clone(), config.rate_limit.clone()));
        let idempotency = Arc::new(IdempotencyStore::new(
            kv.clone(),
            config.idempotency.clone(),
        ));
        let vanguard = VanguardEngine::new(&config, kv.clone(), docs.clone(), queue.clone());

        let baselines = Arc::new(StoreBaselines::new(docs.clone(), "2025-26"));
        let pulse = PulseProducer::new(sports_api, docs.clone(), baselines, config.pulse.clone());

        info!("Supervisor initialized");

        Arc::new(Supervisor {
            config,
            kv,
            docs,
            registry,
            health_gate,
            broadcaster,
            shadow_race,
            router,
            queue,
            limiter,
            idempotency,
            vanguard,
            pulse,
            errors: Arc::new(ErrorLog::new()),
            simulator,
            started_at: Utc::now(),
        })
    }

    /// Start background services.
    pub fn start(self: &Arc<Self>) {
        self.queue.start();
        self.vanguard.start();
        if self.config.pulse.enabled {
            self.pulse.start();
        }
        info!("Supervisor started");
    }

    /// Shut down in LIFO order.
    pub fn shutdown(&self) {
        info!("Shutting down supervisor");
        self.pulse.stop();
        self.vanguard.shutdown();
        self.shadow_race.cancel_all_pending();
        self.queue.stop();
        info!("Supervisor shutdown complete");
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }

    /// Record an error into the operator ring and feed cooldowns.
    pub fn handle_error(&self, error: &NexusError) {
        self.errors.record(error);
        if error.code.triggers_cooldown() {
            self.health_gate
                .record_rate_limit(&error.endpoint, Some(error.cooldown_seconds.max(60)));
        }
    }

    /// Complete system overview for the admin dashboard.
    pub fn overview(&self) -> serde_json::Value {
        let health = self.health_gate.check_all();
        serde_json::json!({
            "status": health.overall,
            "uptime_seconds": self.uptime_seconds(),
            "endpoints": self.registry.summary(),
            "health": health,
            "routing": {
                "decisions": self.router.stats(),
                "shadow_race": self.shadow_race.stats(),
            },
            "queue": self.queue.stats(),
            "errors": self.errors.stats(),
            "timestamp": Utc::now(),
        })
    }
}
