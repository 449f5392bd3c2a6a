//! Routing table - primary/fallback handler selection with blast-radius protection
//!
//! Logical route keys map to a primary handler and an optional fallback.
//! Hysteresis flips the activation flag; the triage pipeline honors it.
//! Health and admin surfaces can never be registered or activated.

use chrono::{DateTime, Utc};
use nexus_registry::is_blast_radius_path;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{info, warn};

/// Route key for the AI triage dependency.
pub const TRIAGE_ROUTE: &str = "gemini_triage_path";

/// One routing table entry.
#[derive(Debug, Clone, Serialize)]
pub struct RouteEntry {
    pub route_key: String,
    pub primary_handler: String,
    pub fallback_handler: Option<String>,
    pub fallback_active: bool,
    pub activation_reason: Option<String>,
    pub activated_at: Option<DateTime<Utc>>,
}

/// Map from logical route keys to handler pairs with an activation flag.
pub struct RoutingTable {
    routes: RwLock<HashMap<String, RouteEntry>>,
}

impl RoutingTable {
    /// Build the table with its default routes.
    pub fn new() -> Self {
        let table = RoutingTable {
            routes: RwLock::new(HashMap::new()),
        };
        table.register(TRIAGE_ROUTE, "llm_analyzer", Some("heuristic_engine"));
        table
    }

    /// Register a route. Blast-radius keys are refused.
    pub fn register(
        &self,
        route_key: &str,
        primary_handler: &str,
        fallback_handler: Option<&str>,
    ) -> bool {
        if is_blast_radius_path(route_key) {
            warn!(route_key, "Refusing to register blast-radius route");
            return false;
        }
        self.routes.write().insert(
            route_key.to_string(),
            RouteEntry {
                route_key: route_key.to_string(),
                primary_handler: primary_handler.to_string(),
                fallback_handler: fallback_handler.map(String::from),
                fallback_active: false,
                activation_reason: None,
                activated_at: None,
            },
        );
        true
    }

    pub fn get_route(&self, route_key: &str) -> Option<RouteEntry> {
        self.routes.read().get(route_key).cloned()
    }

    pub fn is_fallback_active(&self, route_key: &str) -> bool {
        self.routes
            .read()
            .get(route_key)
            .map(|entry| entry.fallback_active)
            .unwrap_or(false)
    }

    /// Flip a route to its fallback handler. Idempotent; returns false for
    /// unknown keys, blast-radius keys, and routes with no fallback.
    pub async fn activate_fallback(&self, route_key: &str, reason: &str) -> bool {
        if is_blast_radius_path(route_key) {
            warn!(route_key, "Blast-radius protection refused fallback activation");
            return false;
        }

        let mut routes = self.routes.write();
        let Some(entry) = routes.get_mut(route_key) else {
            return false;
        };
        if entry.fallback_handler.is_none() {
            return false;
        }
        if entry.fallback_active {
            return true;
        }

        entry.fallback_active = true;
        entry.activation_reason = Some(reason.to_string());
        entry.activated_at = Some(Utc::now());
        warn!(route_key, reason, "Fallback route activated");
        true
    }

    /// Restore the primary handler. Returns how long the fallback was
    /// active, or `None` if it was not active.
    pub async fn deactivate_fallback(&self, route_key: &str) -> Option<chrono::Duration> {
        let mut routes = self.routes.write();
        let entry = routes.get_mut(route_key)?;
        if !entry.fallback_active {
            return None;
        }

        let active_for = entry.activated_at.map(|at| Utc::now() - at);
        entry.fallback_active = false;
        entry.activation_reason = None;
        entry.activated_at = None;
        info!(route_key, "Fallback route deactivated");
        active_for
    }

    /// Entries currently running on their fallback handler.
    pub fn active_fallbacks(&self) -> Vec<RouteEntry> {
        self.routes
            .read()
            .values()
            .filter(|entry| entry.fallback_active)
            .cloned()
            .collect()
    }

    pub fn all_routes(&self) -> Vec<RouteEntry> {
        self.routes.read().values().cloned().collect()
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_routes_include_triage_path() {
        let table = RoutingTable::new();
        let route = table.get_route(TRIAGE_ROUTE).expect("triage route");
        assert_eq!(route.primary_handler, "llm_analyzer");
        assert_eq!(route.fallback_handler.as_deref(), Some("heuristic_engine"));
        assert!(!route.fallback_active);
    }

    #[tokio::test]
    async fn activate_deactivate_round_trip() {
        let table = RoutingTable::new();

        assert!(table.activate_fallback(TRIAGE_ROUTE, "ai outage").await);
        assert!(table.is_fallback_active(TRIAGE_ROUTE));

        let active = table.active_fallbacks();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].route_key, TRIAGE_ROUTE);
        assert_eq!(active[0].activation_reason.as_deref(), Some("ai outage"));

        let active_for = table.deactivate_fallback(TRIAGE_ROUTE).await;
        assert!(active_for.is_some());
        assert!(!table.is_fallback_active(TRIAGE_ROUTE));

        let route = table.get_route(TRIAGE_ROUTE).unwrap();
        assert!(route.activation_reason.is_none());
        assert!(route.activated_at.is_none());
    }

    #[tokio::test]
    async fn activation_is_idempotent() {
        let table = RoutingTable::new();
        assert!(table.activate_fallback(TRIAGE_ROUTE, "first").await);
        assert!(table.activate_fallback(TRIAGE_ROUTE, "second").await);
        // The original reason survives the second call.
        let route = table.get_route(TRIAGE_ROUTE).unwrap();
        assert_eq!(route.activation_reason.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn deactivate_when_not_active_returns_none() {
        let table = RoutingTable::new();
        assert!(table.deactivate_fallback(TRIAGE_ROUTE).await.is_none());
    }

    #[tokio::test]
    async fn blast_radius_keys_are_refused() {
        let table = RoutingTable::new();

        assert!(!table.register("/health", "handler", Some("fallback")));
        assert!(!table.register("/vanguard/admin/stats", "handler", Some("fallback")));
        assert!(!table.activate_fallback("/health", "nope").await);
        assert!(table.get_route("/health").is_none());
    }

    #[tokio::test]
    async fn routes_without_fallback_cannot_activate() {
        let table = RoutingTable::new();
        assert!(table.register("scoreboard_fetch", "live_api", None));
        assert!(!table.activate_fallback("scoreboard_fetch", "outage").await);
        assert!(!table.is_fallback_active("scoreboard_fetch"));
    }

    #[tokio::test]
    async fn unknown_routes_return_false() {
        let table = RoutingTable::new();
        assert!(!table.activate_fallback("missing", "reason").await);
        assert!(table.deactivate_fallback("missing").await.is_none());
        assert!(!table.is_fallback_active("missing"));
    }
}
