//! Endpoint registry - static catalog of supervised endpoints
//!
//! Each endpoint carries the metadata routing decisions depend on: category,
//! dependency list, complexity, patience budget, and an optional cache
//! fallback path. Configs are immutable after registration.

use nexus_common::{ErrorCode, NexusError, Priority, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Categories for endpoint classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EndpointCategory {
    /// Health checks, basic info
    Core,
    /// Monte Carlo, projections
    Simulation,
    /// Matchup analysis, confluence
    Analysis,
    /// Player/team data fetching
    Data,
    /// External API dependent
    External,
    /// Admin-only endpoints
    Admin,
}

impl EndpointCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointCategory::Core => "core",
            EndpointCategory::Simulation => "simulation",
            EndpointCategory::Analysis => "analysis",
            EndpointCategory::Data => "data",
            EndpointCategory::External => "external",
            EndpointCategory::Admin => "admin",
        }
    }
}

/// Configuration for a registered endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub path: String,
    pub category: EndpointCategory,
    pub dependencies: Vec<String>,
    /// 1-10 scale, higher = more resources needed
    pub complexity: u8,
    pub base_timeout_ms: u64,
    pub adaptive_buffer_ms: u64,
    /// Cache path served when the primary fails
    pub fallback_path: Option<String>,
    pub priority: Priority,
    pub manager: Option<String>,
    pub auth_required: bool,
}

impl EndpointConfig {
    pub fn new(path: impl Into<String>, category: EndpointCategory) -> Self {
        EndpointConfig {
            path: path.into(),
            category,
            dependencies: Vec::new(),
            complexity: 5,
            base_timeout_ms: 500,
            adaptive_buffer_ms: 200,
            fallback_path: None,
            priority: Priority::Medium,
            manager: None,
            auth_required: false,
        }
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_complexity(mut self, complexity: u8) -> Self {
        self.complexity = complexity.clamp(1, 10);
        self
    }

    pub fn with_timeouts(mut self, base_ms: u64, buffer_ms: u64) -> Self {
        self.base_timeout_ms = base_ms;
        self.adaptive_buffer_ms = buffer_ms;
        self
    }

    pub fn with_fallback(mut self, path: impl Into<String>) -> Self {
        self.fallback_path = Some(path.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Target budget for a race: base timeout plus the adaptive buffer.
    pub fn dynamic_ttl_ms(&self) -> u64 {
        self.base_timeout_ms + self.adaptive_buffer_ms
    }
}

/// Static catalog of endpoints, keyed by path with longest-prefix fallback.
pub struct EndpointRegistry {
    endpoints: Mutex<HashMap<String, Arc<EndpointConfig>>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        EndpointRegistry {
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    /// Register an endpoint. Duplicate paths are rejected.
    pub fn register(&self, config: EndpointConfig) -> Result<()> {
        let mut endpoints = self.endpoints.lock();
        if endpoints.contains_key(&config.path) {
            return Err(NexusError::new(
                ErrorCode::ConfigurationError,
                format!("endpoint already registered: {}", config.path),
                &config.path,
            ));
        }
        debug!(path = %config.path, category = config.category.as_str(), "Registered endpoint");
        endpoints.insert(config.path.clone(), Arc::new(config));
        Ok(())
    }

    /// Exact lookup, then longest-prefix match for unregistered paths.
    pub fn get(&self, path: &str) -> Option<Arc<EndpointConfig>> {
        let endpoints = self.endpoints.lock();
        if let Some(config) = endpoints.get(path) {
            return Some(config.clone());
        }

        endpoints
            .iter()
            .filter(|(registered, _)| path.starts_with(registered.as_str()))
            .max_by_key(|(registered, _)| registered.len())
            .map(|(_, config)| config.clone())
    }

    pub fn len(&self) -> usize {
        self.endpoints.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.lock().is_empty()
    }

    pub fn all(&self) -> Vec<Arc<EndpointConfig>> {
        self.endpoints.lock().values().cloned().collect()
    }

    /// Grouped counts by category and priority.
    pub fn summary(&self) -> serde_json::Value {
        let endpoints = self.endpoints.lock();

        let mut by_category: HashMap<&'static str, u64> = HashMap::new();
        let mut by_priority: HashMap<&'static str, u64> = HashMap::new();
        for config in endpoints.values() {
            *by_category.entry(config.category.as_str()).or_insert(0) += 1;
            *by_priority.entry(config.priority.as_str()).or_insert(0) += 1;
        }

        serde_json::json!({
            "total": endpoints.len(),
            "by_category": by_category,
            "by_priority": by_priority,
        })
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        let registry = Self::new();
        registry.seed_defaults();
        registry
    }
}

impl EndpointRegistry {
    /// Register the supervised endpoints of this deployment.
    pub fn seed_defaults(&self) {
        let defaults = [
            EndpointConfig::new("/simulate", EndpointCategory::Simulation)
                .with_dependencies(&["vertex_engine", "nba_api"])
                .with_complexity(9)
                .with_timeouts(800, 200)
                .with_fallback("/cache/simulate")
                .with_priority(Priority::High),
            EndpointConfig::new("/matchup/analyze", EndpointCategory::Analysis)
                .with_dependencies(&["matchup_lab", "nba_api"])
                .with_complexity(7)
                .with_timeouts(600, 200)
                .with_fallback("/cache/matchup")
                .with_priority(Priority::High),
            EndpointConfig::new("/confluence", EndpointCategory::Analysis)
                .with_dependencies(&["confluence_scorer"])
                .with_complexity(6)
                .with_timeouts(500, 200)
                .with_fallback("/cache/confluence"),
            EndpointConfig::new("/players/search", EndpointCategory::Data)
                .with_dependencies(&["database"])
                .with_complexity(2)
                .with_timeouts(300, 100),
            EndpointConfig::new("/api/h2h/populate", EndpointCategory::Data)
                .with_dependencies(&["database", "nba_api"])
                .with_complexity(6)
                .with_timeouts(800, 400)
                .with_priority(Priority::Low),
            EndpointConfig::new("/live", EndpointCategory::External)
                .with_dependencies(&["nba_api"])
                .with_complexity(4)
                .with_timeouts(400, 200),
        ];

        for config in defaults {
            if let Err(e) = self.register(config) {
                info!("Skipping default endpoint: {e}");
            }
        }
    }
}
