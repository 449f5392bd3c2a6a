//! Configuration for the Nexus-Vanguard control plane
//!
//! All runtime knobs documented in the design live here with their defaults;
//! logic modules never carry magic constants. [`NexusConfig::from_env`]
//! overlays the environment variables onto the defaults.

use crate::types::VanguardMode;
use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NexusConfig {
    pub gateway: GatewayConfig,
    pub router: RouterConfig,
    pub rate_limit: RateLimitConfig,
    pub idempotency: IdempotencyConfig,
    pub queue: QueueConfig,
    pub vanguard: VanguardConfig,
    pub pulse: PulseConfig,
    pub store: StoreConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub bind_address: String,
    pub port: u16,
    pub request_timeout_ms: u64,
    pub enable_cors: bool,
    /// Stream a health event at this cadence on /health/stream
    pub health_stream_interval_secs: u64,
}

/// Adaptive router / shadow-race configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Patience budget when an endpoint is unregistered
    pub default_patience_ms: u64,
    pub default_buffer_ms: u64,
    /// How long late arrivals stay retrievable
    pub late_arrival_ttl_secs: u64,
    /// Per-listener SSE queue depth; overflow drops the oldest event
    pub listener_queue_capacity: usize,
    /// Last-resort wait for the live branch after the cache fallback fails
    pub last_resort_wait_ms: u64,
}

/// Token-bucket rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub default_limit: u64,
    pub default_window_secs: u64,
    pub admin_limit: u64,
    pub admin_window_secs: u64,
    /// Path prefix selecting the admin bucket
    pub admin_prefix: String,
}

/// Idempotency middleware configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    pub ttl_secs: u64,
    /// FAILED records block retries for this long
    pub failed_cooldown_secs: u64,
    /// Bodies beyond this are stored as a fingerprint sentinel
    pub max_cached_body_bytes: usize,
}

/// Priority queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub critical_concurrency: usize,
    pub high_concurrency: usize,
    pub medium_concurrency: usize,
    pub low_concurrency: usize,
    pub background_concurrency: usize,
    /// Completed-task records retained for status lookup
    pub completed_retention: usize,
}

/// Vanguard incident engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VanguardConfig {
    pub enabled: bool,
    pub mode: VanguardMode,
    pub llm_enabled: bool,
    pub llm_endpoint: String,
    pub llm_model: String,
    pub llm_timeout_secs: u64,
    pub sampling_rate: f64,
    /// Analysis cache lifetime
    pub analysis_ttl_hours: i64,
    /// Escalation loop cadence
    pub escalation_interval_secs: u64,
    pub escalate_below: f64,
    pub deescalate_at: f64,
    /// Bounded fan-out for batch triage
    pub batch_analysis_limit: usize,
    pub vaccine_enabled: bool,
}

/// Live pulse producer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulseConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    /// Leaders kept per game and globally
    pub top_leaders: usize,
    pub stream_tick_secs: u64,
    pub heartbeat_secs: u64,
    pub league_avg_def_rating: f64,
    pub league_avg_pace: f64,
    pub websocket_enabled: bool,
}

/// Shared store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub redis_url: String,
    /// "MEMORY" or "REMOTE"
    pub storage_mode: String,
}

impl Default for NexusConfig {
    fn default() -> Self {
        NexusConfig {
            gateway: GatewayConfig {
                bind_address: "0.0.0.0".to_string(),
                port: 8080,
                request_timeout_ms: 30_000,
                enable_cors: true,
                health_stream_interval_secs: 5,
            },
            router: RouterConfig {
                default_patience_ms: 800,
                default_buffer_ms: 200,
                late_arrival_ttl_secs: 300,
                listener_queue_capacity: 64,
                last_resort_wait_ms: 2_000,
            },
            rate_limit: RateLimitConfig {
                default_limit: 60,
                default_window_secs: 60,
                admin_limit: 30,
                admin_window_secs: 60,
                admin_prefix: "/vanguard/admin".to_string(),
            },
            idempotency: IdempotencyConfig {
                ttl_secs: 86_400,
                failed_cooldown_secs: 2,
                max_cached_body_bytes: 128_000,
            },
            queue: QueueConfig {
                critical_concurrency: 10,
                high_concurrency: 4,
                medium_concurrency: 8,
                low_concurrency: 2,
                background_concurrency: 2,
                completed_retention: 100,
            },
            vanguard: VanguardConfig {
                enabled: true,
                mode: VanguardMode::SilentObserver,
                llm_enabled: false,
                llm_endpoint: "https://generativelanguage.googleapis.com/v1beta/models".to_string(),
                llm_model: "triage-flash".to_string(),
                llm_timeout_secs: 30,
                sampling_rate: 0.05,
                analysis_ttl_hours: 24,
                escalation_interval_secs: 120,
                escalate_below: 45.0,
                deescalate_at: 55.0,
                batch_analysis_limit: 100,
                vaccine_enabled: false,
            },
            pulse: PulseConfig {
                enabled: true,
                poll_interval_secs: 10,
                top_leaders: 15,
                stream_tick_secs: 1,
                heartbeat_secs: 15,
                league_avg_def_rating: 112.0,
                league_avg_pace: 100.0,
                websocket_enabled: false,
            },
            store: StoreConfig {
                redis_url: "redis://localhost:6379".to_string(),
                storage_mode: "MEMORY".to_string(),
            },
        }
    }
}

impl NexusConfig {
    /// Load configuration from environment variables, falling back to the
    /// documented defaults for anything unset or malformed.
    pub fn from_env() -> Self {
        let mut config = NexusConfig::default();

        if let Some(v) = env_bool("VANGUARD_ENABLED") {
            config.vanguard.enabled = v;
        }
        if let Ok(raw) = std::env::var("VANGUARD_MODE") {
            match raw.parse::<VanguardMode>() {
                Ok(mode) => config.vanguard.mode = mode,
                Err(e) => tracing::warn!("Ignoring VANGUARD_MODE: {e}"),
            }
        }
        if let Some(v) = env_bool("VANGUARD_LLM_ENABLED") {
            config.vanguard.llm_enabled = v;
        }
        if let Some(v) = env_parse::<u64>("VANGUARD_LLM_TIMEOUT_SEC") {
            config.vanguard.llm_timeout_secs = v;
        }
        if let Some(v) = env_parse::<f64>("VANGUARD_SAMPLING_RATE") {
            config.vanguard.sampling_rate = v.clamp(0.0, 1.0);
        }
        if let Ok(v) = std::env::var("VANGUARD_STORAGE_MODE") {
            config.store.storage_mode = v;
        }
        if let Ok(v) = std::env::var("REDIS_URL") {
            config.store.redis_url = v;
        }
        if let Some(v) = env_bool("PULSE_SERVICE_ENABLED") {
            config.pulse.enabled = v;
        }
        if let Some(v) = env_bool("FEATURE_WEBSOCKET_ENABLED") {
            config.pulse.websocket_enabled = v;
        }
        if let Some(v) = env_parse::<u16>("PORT") {
            config.gateway.port = v;
        }

        config
    }

    /// Concurrency cap for a priority level.
    pub fn concurrency_for(&self, priority: crate::types::Priority) -> usize {
        use crate::types::Priority::*;
        match priority {
            Critical => self.queue.critical_concurrency,
            High => self.queue.high_concurrency,
            Medium => self.queue.medium_concurrency,
            Low => self.queue.low_concurrency,
            Background => self.queue.background_concurrency,
        }
    }
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| {
        matches!(
            v.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
