//! Adaptive router - advisory routing decisions
//!
//! For each request path the router recommends cache-only, live-only, or a
//! shadow-race, based on the endpoint's registered metadata and the health
//! gate's cooldown state. The router advises; it never intercepts.

use nexus_registry::{EndpointRegistry, HealthGate};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Recommended execution strategy.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RouteStrategy {
    CacheOnly,
    LiveOnly,
    Race,
    Fallback,
}

impl RouteStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteStrategy::CacheOnly => "cache_only",
            RouteStrategy::LiveOnly => "live_only",
            RouteStrategy::Race => "race",
            RouteStrategy::Fallback => "fallback",
        }
    }
}

/// Routing recommendation for one request.
#[derive(Debug, Clone, Serialize)]
pub struct RouteDecision {
    pub strategy: RouteStrategy,
    pub patience_ms: u64,
    pub target_ms: u64,
    pub rationale: String,
    pub cooldown_active: bool,
}

/// Per-request routing context.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteContext {
    pub force_fresh: bool,
}

/// Advisory router over the registry and health gate.
pub struct AdaptiveRouter {
    registry: Arc<EndpointRegistry>,
    health_gate: Arc<HealthGate>,
    default_patience_ms: u64,
    default_buffer_ms: u64,
    decisions: Mutex<HashMap<RouteStrategy, u64>>,
}

impl AdaptiveRouter {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        health_gate: Arc<HealthGate>,
        default_patience_ms: u64,
        default_buffer_ms: u64,
    ) -> Self {
        AdaptiveRouter {
            registry,
            health_gate,
            default_patience_ms,
            default_buffer_ms,
            decisions: Mutex::new(HashMap::new()),
        }
    }

    /// Recommend a strategy for a path.
    pub fn recommend(&self, path: &str, ctx: RouteContext) -> RouteDecision {
        let decision = self.decide(path, ctx);
        *self.decisions.lock().entry(decision.strategy).or_insert(0) += 1;
        debug!(
            path,
            strategy = decision.strategy.as_str(),
            patience_ms = decision.patience_ms,
            "Route decision"
        );
        decision
    }

    fn decide(&self, path: &str, ctx: RouteContext) -> RouteDecision {
        let Some(endpoint) = self.registry.get(path) else {
            let patience = self.default_patience_ms + self.default_buffer_ms;
            return RouteDecision {
                strategy: RouteStrategy::LiveOnly,
                patience_ms: patience,
                target_ms: patience,
                rationale: "unregistered endpoint, defaulting to live".to_string(),
                cooldown_active: false,
            };
        };

        // Cooldown on the endpoint itself or any dependency forces cache.
        let cooled: Option<String> = if self.health_gate.is_in_cooldown(&endpoint.path) {
            Some(endpoint.path.clone())
        } else {
            endpoint
                .dependencies
                .iter()
                .find(|dep| self.health_gate.is_in_cooldown(dep))
                .cloned()
        };

        if let Some(service) = cooled {
            return RouteDecision {
                strategy: RouteStrategy::CacheOnly,
                patience_ms: 0,
                target_ms: endpoint.dynamic_ttl_ms(),
                rationale: format!("{service} is in cooldown, serving cache intentionally"),
                cooldown_active: true,
            };
        }

        let all_deps_healthy = endpoint
            .dependencies
            .iter()
            .all(|dep| self.health_gate.is_service_available(dep));

        if all_deps_healthy && ctx.force_fresh {
            return RouteDecision {
                strategy: RouteStrategy::LiveOnly,
                patience_ms: endpoint.dynamic_ttl_ms(),
                target_ms: endpoint.dynamic_ttl_ms(),
                rationale: "fresh data requested and dependencies healthy".to_string(),
                cooldown_active: false,
            };
        }

        RouteDecision {
            strategy: RouteStrategy::Race,
            patience_ms: endpoint.base_timeout_ms,
            target_ms: endpoint.dynamic_ttl_ms(),
            rationale: "racing live against cache within patience budget".to_string(),
            cooldown_active: false,
        }
    }

    /// Current decision for every registered endpoint.
    pub fn route_matrix(&self) -> Vec<serde_json::Value> {
        self.registry
            .all()
            .into_iter()
            .map(|endpoint| {
                let decision = self.decide(&endpoint.path, RouteContext::default());
                serde_json::json!({
                    "path": endpoint.path,
                    "category": endpoint.category,
                    "strategy": decision.strategy,
                    "patience_ms": decision.patience_ms,
                    "target_ms": decision.target_ms,
                    "cooldown_active": decision.cooldown_active,
                })
            })
            .collect()
    }

    /// Decision counters by strategy.
    pub fn stats(&self) -> serde_json::Value {
        let decisions = self.decisions.lock();
        let by_strategy: HashMap<&'static str, u64> = decisions
            .iter()
            .map(|(strategy, count)| (strategy.as_str(), *count))
            .collect();
        serde_json::json!({
            "total_decisions": decisions.values().sum::<u64>(),
            "by_strategy": by_strategy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_common::Priority;
    use nexus_registry::{EndpointCategory, EndpointConfig};

    fn setup() -> (Arc<EndpointRegistry>, Arc<HealthGate>, AdaptiveRouter) {
        let registry = Arc::new(EndpointRegistry::new());
        registry
            .register(
                EndpointConfig::new("/simulate", EndpointCategory::Simulation)
                    .with_dependencies(&["nba_api", "vertex_engine"])
                    .with_timeouts(800, 200)
                    .with_fallback("/cache/simulate")
                    .with_priority(Priority::High),
            )
            .unwrap();
        let gate = Arc::new(HealthGate::new());
        gate.register_service("vertex_engine", nexus_registry::ServiceType::Component);
        let router = AdaptiveRouter::new(registry.clone(), gate.clone(), 800, 200);
        (registry, gate, router)
    }

    #[test]
    fn unknown_path_defaults_to_live_only() {
        let (_, _, router) = setup();
        let decision = router.recommend("/nowhere", RouteContext::default());
        assert_eq!(decision.strategy, RouteStrategy::LiveOnly);
        assert_eq!(decision.patience_ms, 1000);
    }

    #[test]
    fn cooldown_on_dependency_forces_cache() {
        let (_, gate, router) = setup();
        gate.enter_cooldown("nba_api", Some(60));

        let decision = router.recommend("/simulate", RouteContext::default());
        assert_eq!(decision.strategy, RouteStrategy::CacheOnly);
        assert!(decision.cooldown_active);
        assert!(decision.rationale.contains("nba_api"));
    }

    #[test]
    fn force_fresh_with_healthy_deps_goes_live() {
        let (_, _, router) = setup();
        let decision = router.recommend("/simulate", RouteContext { force_fresh: true });
        assert_eq!(decision.strategy, RouteStrategy::LiveOnly);
    }

    #[test]
    fn default_is_race_with_budgets_from_config() {
        let (_, _, router) = setup();
        let decision = router.recommend("/simulate", RouteContext::default());
        assert_eq!(decision.strategy, RouteStrategy::Race);
        assert_eq!(decision.patience_ms, 800);
        assert_eq!(decision.target_ms, 1000);
        // Race decisions always keep patience within the target budget.
        assert!(decision.patience_ms <= decision.target_ms);
    }

    #[test]
    fn stats_count_decisions() {
        let (_, _, router) = setup();
        router.recommend("/simulate", RouteContext::default());
        router.recommend("/simulate", RouteContext::default());
        router.recommend("/nowhere", RouteContext::default());

        let stats = router.stats();
        assert_eq!(stats["total_decisions"], 3);
        assert_eq!(stats["by_strategy"]["race"], 2);
        assert_eq!(stats["by_strategy"]["live_only"], 1);
    }

    #[test]
    fn route_matrix_lists_registered_endpoints() {
        let (_, _, router) = setup();
        let matrix = router.route_matrix();
        assert_eq!(matrix.len(), 1);
        assert_eq!(matrix[0]["path"], "/simulate");
    }
}
