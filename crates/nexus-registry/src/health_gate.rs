//! Health gate - unified health monitoring with cooldown mode
//!
//! Aggregates per-service health and tracks rate-limit cooldowns. During a
//! cooldown the router serves fallbacks intentionally instead of hammering
//! the rate-limited dependency. All state sits behind one mutex; no caller
//! can observe a partially updated record.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

/// Health status levels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
    Down,
    /// Intentionally paused after a rate limit hit
    Cooldown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Critical => "critical",
            HealthStatus::Down => "down",
            HealthStatus::Cooldown => "cooldown",
        }
    }
}

/// Types of services monitored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    /// Stores, internal systems
    Core,
    /// Sports API, AI triage
    External,
    /// Supervisor components
    Component,
}

/// Health state for a single service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub name: String,
    pub service_type: ServiceType,
    pub status: HealthStatus,
    pub last_check: DateTime<Utc>,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub response_time_ms: Option<f64>,
}

impl ServiceHealth {
    fn new(name: &str, service_type: ServiceType) -> Self {
        ServiceHealth {
            name: name.to_string(),
            service_type,
            status: HealthStatus::Healthy,
            last_check: Utc::now(),
            error_count: 0,
            last_error: None,
            cooldown_until: None,
            response_time_ms: None,
        }
    }

    /// Usable right now (not down, not in cooldown).
    pub fn is_available(&self) -> bool {
        if matches!(self.status, HealthStatus::Down | HealthStatus::Cooldown) {
            return false;
        }
        if let Some(until) = self.cooldown_until {
            if Utc::now() < until {
                return false;
            }
        }
        true
    }
}

/// Aggregated system health snapshot. Rebuilt by [`HealthGate::check_all`],
/// consumed per request, never cached.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub overall: HealthStatus,
    pub core: HashMap<String, ServiceHealth>,
    pub external: HashMap<String, ServiceHealth>,
    pub components: HashMap<String, ServiceHealth>,
    pub cooldowns: HashMap<String, DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

const DEFAULT_COOLDOWN_SECONDS: u64 = 60;

struct GateState {
    services: HashMap<String, ServiceHealth>,
    cooldowns: HashMap<String, DateTime<Utc>>,
}

/// Unified health checking with smart throttling.
pub struct HealthGate {
    state: Mutex<GateState>,
}

impl HealthGate {
    pub fn new() -> Self {
        let gate = HealthGate {
            state: Mutex::new(GateState {
                services: HashMap::new(),
                cooldowns: HashMap::new(),
            }),
        };
        gate.init_services();
        info!("HealthGate initialized");
        gate
    }

    fn init_services(&self) {
        let mut state = self.state.lock();

        for name in ["database", "document_store", "kv_store"] {
            state
                .services
                .insert(name.to_string(), ServiceHealth::new(name, ServiceType::Core));
        }
        for name in ["nba_api", "ai_triage"] {
            state
                .services
                .insert(name.to_string(), ServiceHealth::new(name, ServiceType::External));
        }
        for name in [
            "adaptive_router",
            "priority_queue",
            "vanguard_engine",
            "pulse_producer",
        ] {
            state.services.insert(
                name.to_string(),
                ServiceHealth::new(name, ServiceType::Component),
            );
        }
    }

    /// Track a service not present in the default catalog.
    pub fn register_service(&self, name: &str, service_type: ServiceType) {
        let mut state = self.state.lock();
        state
            .services
            .entry(name.to_string())
            .or_insert_with(|| ServiceHealth::new(name, service_type));
    }

    /// Atomically rebuild the aggregate snapshot.
    pub fn check_all(&self) -> SystemHealth {
        let mut state = self.state.lock();
        let now = Utc::now();

        Self::cleanup_cooldowns(&mut state);

        // Refresh cooldown status on services with a live cooldown.
        let cooldowns = state.cooldowns.clone();
        for (service, until) in &cooldowns {
            if let Some(svc) = state.services.get_mut(service) {
                svc.status = HealthStatus::Cooldown;
                svc.cooldown_until = Some(*until);
            }
        }

        let mut core = HashMap::new();
        let mut external = HashMap::new();
        let mut components = HashMap::new();
        for (name, svc) in &state.services {
            match svc.service_type {
                ServiceType::Core => core.insert(name.clone(), svc.clone()),
                ServiceType::External => external.insert(name.clone(), svc.clone()),
                ServiceType::Component => components.insert(name.clone(), svc.clone()),
            };
        }

        let overall = Self::calculate_overall(&core, &external, &components);

        SystemHealth {
            overall,
            core,
            external,
            components,
            cooldowns,
            timestamp: now,
        }
    }

    fn calculate_overall(
        core: &HashMap<String, ServiceHealth>,
        external: &HashMap<String, ServiceHealth>,
        components: &HashMap<String, ServiceHealth>,
    ) -> HealthStatus {
        // Any core service down is critical regardless of everything else.
        if core.values().any(|s| s.status == HealthStatus::Down) {
            return HealthStatus::Critical;
        }

        let all: Vec<&ServiceHealth> = core
            .values()
            .chain(external.values())
            .chain(components.values())
            .collect();

        let down = all.iter().filter(|s| s.status == HealthStatus::Down).count();
        let cooldown = all
            .iter()
            .filter(|s| s.status == HealthStatus::Cooldown)
            .count();
        let degraded = all
            .iter()
            .filter(|s| s.status == HealthStatus::Degraded)
            .count();

        if down > all.len() / 2 {
            HealthStatus::Down
        } else if down > 0 || cooldown > 2 {
            HealthStatus::Critical
        } else if degraded > 0 || cooldown > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Put a service in cooldown after a rate limit hit.
    pub fn enter_cooldown(&self, service: &str, duration_secs: Option<u64>) {
        let duration = duration_secs.unwrap_or(DEFAULT_COOLDOWN_SECONDS);
        let expires = Utc::now() + Duration::seconds(duration as i64);

        let mut state = self.state.lock();
        state.cooldowns.insert(service.to_string(), expires);
        if let Some(svc) = state.services.get_mut(service) {
            svc.status = HealthStatus::Cooldown;
            svc.cooldown_until = Some(expires);
        }

        warn!(service, duration, "COOLDOWN entered until {expires}");
    }

    /// Manually exit a cooldown. The service comes back as degraded until a
    /// success verifies it.
    pub fn exit_cooldown(&self, service: &str) {
        let mut state = self.state.lock();
        state.cooldowns.remove(service);
        if let Some(svc) = state.services.get_mut(service) {
            svc.status = HealthStatus::Degraded;
            svc.cooldown_until = None;
        }
        info!(service, "Exited cooldown");
    }

    pub fn is_in_cooldown(&self, service: &str) -> bool {
        let mut state = self.state.lock();
        match state.cooldowns.get(service) {
            None => false,
            Some(until) if Utc::now() > *until => {
                state.cooldowns.remove(service);
                if let Some(svc) = state.services.get_mut(service) {
                    svc.status = HealthStatus::Degraded;
                    svc.cooldown_until = None;
                }
                false
            }
            Some(_) => true,
        }
    }

    pub fn cooldown_remaining_secs(&self, service: &str) -> u64 {
        if !self.is_in_cooldown(service) {
            return 0;
        }
        let state = self.state.lock();
        state
            .cooldowns
            .get(service)
            .map(|until| (*until - Utc::now()).num_seconds().max(0) as u64)
            .unwrap_or(0)
    }

    /// All active cooldowns with expiry details.
    pub fn active_cooldowns(&self) -> HashMap<String, serde_json::Value> {
        let mut state = self.state.lock();
        Self::cleanup_cooldowns(&mut state);
        let now = Utc::now();
        state
            .cooldowns
            .iter()
            .map(|(service, expires)| {
                (
                    service.clone(),
                    serde_json::json!({
                        "expires": expires,
                        "remaining_seconds": (*expires - now).num_seconds().max(0),
                    }),
                )
            })
            .collect()
    }

    fn cleanup_cooldowns(state: &mut GateState) {
        let now = Utc::now();
        let expired: Vec<String> = state
            .cooldowns
            .iter()
            .filter(|(_, exp)| now > **exp)
            .map(|(s, _)| s.clone())
            .collect();
        for service in expired {
            state.cooldowns.remove(&service);
            if let Some(svc) = state.services.get_mut(&service) {
                svc.status = HealthStatus::Degraded;
                svc.cooldown_until = None;
            }
            info!(service, "Cooldown expired");
        }
    }

    /// Record an error for a service; repeated errors degrade then down it.
    pub fn record_error(&self, service: &str, error: &str) {
        let mut state = self.state.lock();
        if let Some(svc) = state.services.get_mut(service) {
            svc.error_count += 1;
            svc.last_error = Some(error.to_string());
            svc.last_check = Utc::now();

            if svc.error_count >= 5 {
                svc.status = HealthStatus::Down;
            } else if svc.error_count >= 3 {
                svc.status = HealthStatus::Degraded;
            }
        }
        warn!(service, error, "Error recorded");
    }

    /// Record a success; walks the error count back toward healthy.
    pub fn record_success(&self, service: &str, response_time_ms: Option<f64>) {
        let mut state = self.state.lock();
        if let Some(svc) = state.services.get_mut(service) {
            svc.last_check = Utc::now();
            svc.response_time_ms = response_time_ms;
            svc.last_error = None;

            if matches!(svc.status, HealthStatus::Degraded | HealthStatus::Down) {
                svc.error_count = svc.error_count.saturating_sub(1);
                if svc.error_count == 0 {
                    svc.status = HealthStatus::Healthy;
                }
            }
        }
    }

    /// Combined 429 handling: cooldown plus an error record.
    pub fn record_rate_limit(&self, service: &str, retry_after_secs: Option<u64>) {
        let duration = retry_after_secs.unwrap_or(DEFAULT_COOLDOWN_SECONDS);
        self.enter_cooldown(service, Some(duration));
        self.record_error(
            service,
            &format!("Rate limited (429) - cooldown for {duration}s"),
        );
    }

    pub fn is_service_available(&self, service: &str) -> bool {
        if self.is_in_cooldown(service) {
            return false;
        }
        let state = self.state.lock();
        state
            .services
            .get(service)
            .map(|s| s.is_available())
            .unwrap_or(true)
    }

    pub fn service_status(&self, service: &str) -> Option<ServiceHealth> {
        self.state.lock().services.get(service).cloned()
    }

    /// Flip a component between healthy and down.
    pub fn update_component_status(&self, component: &str, available: bool) {
        let mut state = self.state.lock();
        if let Some(svc) = state.services.get_mut(component) {
            svc.status = if available {
                HealthStatus::Healthy
            } else {
                HealthStatus::Down
            };
            svc.last_check = Utc::now();
        }
    }
}

impl Default for HealthGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_degrade_then_down() {
        let gate = HealthGate::new();
        for _ in 0..3 {
            gate.record_error("nba_api", "boom");
        }
        assert_eq!(
            gate.service_status("nba_api").unwrap().status,
            HealthStatus::Degraded
        );
        for _ in 0..2 {
            gate.record_error("nba_api", "boom");
        }
        assert_eq!(
            gate.service_status("nba_api").unwrap().status,
            HealthStatus::Down
        );
        assert!(!gate.is_service_available("nba_api"));
    }

    #[test]
    fn successes_walk_back_to_healthy() {
        let gate = HealthGate::new();
        for _ in 0..3 {
            gate.record_error("nba_api", "boom");
        }
        // One success per error, monotonically, until healthy again.
        for remaining in (0..3).rev() {
            gate.record_success("nba_api", Some(42.0));
            let svc = gate.service_status("nba_api").unwrap();
            assert_eq!(svc.error_count, remaining);
        }
        assert_eq!(
            gate.service_status("nba_api").unwrap().status,
            HealthStatus::Healthy
        );
    }

    #[test]
    fn cooldown_round_trip() {
        let gate = HealthGate::new();
        gate.enter_cooldown("nba_api", Some(60));
        assert!(gate.is_in_cooldown("nba_api"));
        assert!(!gate.is_service_available("nba_api"));
        assert!(gate.cooldown_remaining_secs("nba_api") > 0);

        gate.exit_cooldown("nba_api");
        assert!(!gate.is_in_cooldown("nba_api"));
        assert_eq!(
            gate.service_status("nba_api").unwrap().status,
            HealthStatus::Degraded
        );
    }

    #[test]
    fn rate_limit_enters_cooldown_and_records_error() {
        let gate = HealthGate::new();
        gate.record_rate_limit("nba_api", Some(30));
        assert!(gate.is_in_cooldown("nba_api"));
        let svc = gate.service_status("nba_api").unwrap();
        assert_eq!(svc.error_count, 1);
        assert!(svc.last_error.unwrap().contains("429"));
    }

    #[test]
    fn core_service_down_is_critical() {
        let gate = HealthGate::new();
        for _ in 0..5 {
            gate.record_error("database", "connection refused");
        }
        let health = gate.check_all();
        assert_eq!(health.overall, HealthStatus::Critical);
    }

    #[test]
    fn three_cooldowns_are_critical() {
        let gate = HealthGate::new();
        gate.enter_cooldown("nba_api", Some(60));
        gate.enter_cooldown("ai_triage", Some(60));
        gate.enter_cooldown("adaptive_router", Some(60));
        let health = gate.check_all();
        assert_eq!(health.overall, HealthStatus::Critical);
    }

    #[test]
    fn single_degraded_service_degrades_overall() {
        let gate = HealthGate::new();
        for _ in 0..3 {
            gate.record_error("ai_triage", "slow");
        }
        let health = gate.check_all();
        assert_eq!(health.overall, HealthStatus::Degraded);
    }

    #[test]
    fn healthy_by_default() {
        let gate = HealthGate::new();
        assert_eq!(gate.check_all().overall, HealthStatus::Healthy);
    }
}
