//! Unified error taxonomy for the Nexus-Vanguard control plane
//!
//! Every failure surfaced to a caller is a [`NexusError`] carrying a code
//! from the closed [`ErrorCode`] taxonomy, the failing endpoint, and
//! advisory recovery information. Raw failures are converted through
//! [`classify_fault`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Result type alias for Nexus operations
pub type Result<T> = std::result::Result<T, NexusError>;

/// Closed error taxonomy, organized by HTTP class.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // 400
    MissingParam,
    InvalidParam,
    InvalidPlayerId,
    InvalidTeamId,
    InvalidSeason,
    InvalidGameId,
    // 401
    AuthRequired,
    InvalidApiKey,
    // 403
    AdminRequired,
    // 404
    PlayerNotFound,
    TeamNotFound,
    GameNotFound,
    StatsNotFound,
    SeasonNotFound,
    EndpointNotFound,
    CacheNotFound,
    // 429
    NbaApiRateLimited,
    AiRateLimited,
    InternalRateLimited,
    // 500
    DatabaseError,
    CalculationError,
    SerializationError,
    ConfigurationError,
    UnknownError,
    // 502
    ExternalApiError,
    UpstreamError,
    // 503
    RouterDown,
    EngineDown,
    MatchupDown,
    EnrichmentDown,
    NbaApiDown,
    AiDown,
    DatabaseDown,
    ServiceUnavailable,
    // 504
    NbaApiTimeout,
    AiTimeout,
    SimulationTimeout,
    DatabaseTimeout,
}

impl ErrorCode {
    /// HTTP status this code maps to.
    pub fn http_status(&self) -> u16 {
        use ErrorCode::*;
        match self {
            MissingParam | InvalidParam | InvalidPlayerId | InvalidTeamId | InvalidSeason
            | InvalidGameId => 400,
            AuthRequired | InvalidApiKey => 401,
            AdminRequired => 403,
            PlayerNotFound | TeamNotFound | GameNotFound | StatsNotFound | SeasonNotFound
            | EndpointNotFound | CacheNotFound => 404,
            NbaApiRateLimited | AiRateLimited | InternalRateLimited => 429,
            DatabaseError | CalculationError | SerializationError | ConfigurationError
            | UnknownError => 500,
            ExternalApiError | UpstreamError => 502,
            RouterDown | EngineDown | MatchupDown | EnrichmentDown | NbaApiDown | AiDown
            | DatabaseDown | ServiceUnavailable => 503,
            NbaApiTimeout | AiTimeout | SimulationTimeout | DatabaseTimeout => 504,
        }
    }

    /// True for codes that put a dependency into cooldown.
    pub fn triggers_cooldown(&self) -> bool {
        matches!(
            self,
            ErrorCode::NbaApiRateLimited
                | ErrorCode::AiRateLimited
                | ErrorCode::InternalRateLimited
        )
    }

    pub fn as_str(&self) -> &'static str {
        use ErrorCode::*;
        match self {
            MissingParam => "MISSING_PARAM",
            InvalidParam => "INVALID_PARAM",
            InvalidPlayerId => "INVALID_PLAYER_ID",
            InvalidTeamId => "INVALID_TEAM_ID",
            InvalidSeason => "INVALID_SEASON",
            InvalidGameId => "INVALID_GAME_ID",
            AuthRequired => "AUTH_REQUIRED",
            InvalidApiKey => "INVALID_API_KEY",
            AdminRequired => "ADMIN_REQUIRED",
            PlayerNotFound => "PLAYER_NOT_FOUND",
            TeamNotFound => "TEAM_NOT_FOUND",
            GameNotFound => "GAME_NOT_FOUND",
            StatsNotFound => "STATS_NOT_FOUND",
            SeasonNotFound => "SEASON_NOT_FOUND",
            EndpointNotFound => "ENDPOINT_NOT_FOUND",
            CacheNotFound => "CACHE_NOT_FOUND",
            NbaApiRateLimited => "NBA_API_RATE_LIMITED",
            AiRateLimited => "AI_RATE_LIMITED",
            InternalRateLimited => "INTERNAL_RATE_LIMITED",
            DatabaseError => "DATABASE_ERROR",
            CalculationError => "CALCULATION_ERROR",
            SerializationError => "SERIALIZATION_ERROR",
            ConfigurationError => "CONFIGURATION_ERROR",
            UnknownError => "UNKNOWN_ERROR",
            ExternalApiError => "EXTERNAL_API_ERROR",
            UpstreamError => "UPSTREAM_ERROR",
            RouterDown => "ROUTER_DOWN",
            EngineDown => "ENGINE_DOWN",
            MatchupDown => "MATCHUP_DOWN",
            EnrichmentDown => "ENRICHMENT_DOWN",
            NbaApiDown => "NBA_API_DOWN",
            AiDown => "AI_DOWN",
            DatabaseDown => "DATABASE_DOWN",
            ServiceUnavailable => "SERVICE_UNAVAILABLE",
            NbaApiTimeout => "NBA_API_TIMEOUT",
            AiTimeout => "AI_TIMEOUT",
            SimulationTimeout => "SIMULATION_TIMEOUT",
            DatabaseTimeout => "DATABASE_TIMEOUT",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error returned by every Nexus endpoint.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{code}: {message} ({endpoint})")]
pub struct NexusError {
    pub code: ErrorCode,
    pub message: String,
    pub endpoint: String,
    pub http_status: u16,
    pub details: Option<serde_json::Value>,
    pub recovery_action: Option<String>,
    pub fallback_available: bool,
    pub cooldown_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

impl NexusError {
    pub fn new(code: ErrorCode, message: impl Into<String>, endpoint: impl Into<String>) -> Self {
        NexusError {
            http_status: code.http_status(),
            code,
            message: message.into(),
            endpoint: endpoint.into(),
            details: None,
            recovery_action: None,
            fallback_available: false,
            cooldown_seconds: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_recovery(mut self, action: impl Into<String>) -> Self {
        self.recovery_action = Some(action.into());
        self
    }

    pub fn with_fallback(mut self, available: bool) -> Self {
        self.fallback_available = available;
        self
    }

    pub fn with_cooldown(mut self, seconds: u64) -> Self {
        self.cooldown_seconds = seconds;
        self
    }

    /// JSON body shape shared by every error response.
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::json!({ "error": self })
    }
}

impl From<serde_json::Error> for NexusError {
    fn from(e: serde_json::Error) -> Self {
        NexusError::new(ErrorCode::SerializationError, e.to_string(), "internal")
    }
}

/// Classify a raw failure into the taxonomy.
///
/// Inputs are the failure's type name and message (lowercased internally),
/// matching on the same signals the original classifier keyed on.
/// Returns the code, a caller-facing message, and an advisory recovery hint.
pub fn classify_fault(error_type: &str, message: &str) -> (ErrorCode, String, &'static str) {
    let msg = message.to_ascii_lowercase();
    let ty = error_type.to_ascii_lowercase();

    // Rate limiting
    if msg.contains("429") || msg.contains("rate limit") || msg.contains("too many") {
        if msg.contains("ai") || msg.contains("triage") {
            return (
                ErrorCode::AiRateLimited,
                "AI service rate limited - using cached analysis".to_string(),
                "Wait 60s or use cached fallback",
            );
        }
        return (
            ErrorCode::NbaApiRateLimited,
            "Sports API rate limited - entering cooldown".to_string(),
            "Wait 60s or use cached fallback",
        );
    }

    // Timeouts
    if msg.contains("timeout") || msg.contains("timed out") || ty.contains("timeout") {
        if msg.contains("ai") || msg.contains("triage") {
            return (
                ErrorCode::AiTimeout,
                "AI service timeout".to_string(),
                "Retry with longer timeout or use cache",
            );
        }
        if msg.contains("database") || msg.contains("store") {
            return (
                ErrorCode::DatabaseTimeout,
                "Store query timeout".to_string(),
                "Try a simpler query or check store health",
            );
        }
        return (
            ErrorCode::NbaApiTimeout,
            "External API timeout - check network".to_string(),
            "Retry with longer timeout or use cache",
        );
    }

    // Not found
    if msg.contains("not found") || msg.contains("no data") || msg.contains("does not exist") {
        if msg.contains("player") {
            return (
                ErrorCode::PlayerNotFound,
                "Player not found".to_string(),
                "Verify player ID is correct",
            );
        }
        if msg.contains("team") {
            return (
                ErrorCode::TeamNotFound,
                "Team not found".to_string(),
                "Verify team abbreviation or ID",
            );
        }
        if msg.contains("game") {
            return (
                ErrorCode::GameNotFound,
                "Game not found".to_string(),
                "Verify game ID is correct",
            );
        }
        return (
            ErrorCode::StatsNotFound,
            "Requested data not found".to_string(),
            "Check parameters and try again",
        );
    }

    // Service unavailable
    if msg.contains("not available") || msg.contains("not initialized") || msg.contains("unavailable")
    {
        if msg.contains("router") {
            return (
                ErrorCode::RouterDown,
                "Adaptive router not available".to_string(),
                "Check supervisor initialization",
            );
        }
        if msg.contains("engine") || msg.contains("simulation") {
            return (
                ErrorCode::EngineDown,
                "Simulation engine not available".to_string(),
                "Check engine initialization",
            );
        }
        if msg.contains("matchup") {
            return (
                ErrorCode::MatchupDown,
                "Matchup analysis not available".to_string(),
                "Check matchup initialization",
            );
        }
        if msg.contains("enrichment") {
            return (
                ErrorCode::EnrichmentDown,
                "Enrichment service not available".to_string(),
                "Service may be restarting",
            );
        }
        return (
            ErrorCode::ServiceUnavailable,
            "Service temporarily unavailable".to_string(),
            "Service may be restarting",
        );
    }

    // Store errors
    if msg.contains("database") || msg.contains("connection") || ty.contains("store") {
        return (
            ErrorCode::DatabaseError,
            "Store connection error".to_string(),
            "Check store reachability",
        );
    }

    // Validation
    if msg.contains("invalid") || msg.contains("validation") {
        if msg.contains("player") {
            return (
                ErrorCode::InvalidPlayerId,
                "Invalid player ID format".to_string(),
                "Use a numeric player ID",
            );
        }
        if msg.contains("team") {
            return (
                ErrorCode::InvalidTeamId,
                "Invalid team ID or abbreviation".to_string(),
                "Use a valid team abbreviation (e.g. LAL, BOS)",
            );
        }
        return (
            ErrorCode::InvalidParam,
            "Invalid parameter provided".to_string(),
            "Check API documentation for valid parameters",
        );
    }

    // Missing parameters
    if msg.contains("missing") || msg.contains("required") {
        return (
            ErrorCode::MissingParam,
            "Required parameter missing".to_string(),
            "Provide all required parameters",
        );
    }

    // Authorization
    if msg.contains("unauthorized") || msg.contains("auth") {
        if msg.contains("admin") {
            return (
                ErrorCode::AdminRequired,
                "Admin access required".to_string(),
                "Provide a valid admin API key",
            );
        }
        return (
            ErrorCode::AuthRequired,
            "Authentication required".to_string(),
            "Provide a valid API key",
        );
    }

    // Calculation
    if msg.contains("division") || msg.contains("zero") || msg.contains("overflow") {
        return (
            ErrorCode::CalculationError,
            "Calculation error".to_string(),
            "Check input data validity",
        );
    }

    // Serialization
    if msg.contains("json") || msg.contains("serialize") || msg.contains("deserialize") {
        return (
            ErrorCode::SerializationError,
            "Data serialization error".to_string(),
            "Check data format",
        );
    }

    (
        ErrorCode::UnknownError,
        format!("An unexpected error occurred: {error_type}"),
        "Check server logs for details",
    )
}

/// Ring of the most recent errors plus per-code counters, exposed to
/// operators at `/vanguard/admin/stats`.
pub struct ErrorLog {
    inner: Mutex<ErrorLogInner>,
    capacity: usize,
}

struct ErrorLogInner {
    counts: HashMap<ErrorCode, u64>,
    recent: Vec<NexusError>,
}

impl ErrorLog {
    pub fn new() -> Self {
        ErrorLog {
            inner: Mutex::new(ErrorLogInner {
                counts: HashMap::new(),
                recent: Vec::new(),
            }),
            capacity: 100,
        }
    }

    /// Record an error, evicting the oldest past capacity.
    pub fn record(&self, error: &NexusError) {
        let mut inner = self.inner.lock();
        *inner.counts.entry(error.code).or_insert(0) += 1;
        inner.recent.push(error.clone());
        if inner.recent.len() > self.capacity {
            let overflow = inner.recent.len() - self.capacity;
            inner.recent.drain(0..overflow);
        }
    }

    /// Aggregate statistics for the admin dashboard.
    pub fn stats(&self) -> serde_json::Value {
        let inner = self.inner.lock();
        let total: u64 = inner.counts.values().sum();

        let mut by_category: HashMap<String, u64> = HashMap::new();
        for (code, count) in &inner.counts {
            let category = format!("{}xx", code.http_status() / 100);
            *by_category.entry(category).or_insert(0) += count;
        }

        let by_code: HashMap<&'static str, u64> =
            inner.counts.iter().map(|(c, n)| (c.as_str(), *n)).collect();

        let recent: Vec<serde_json::Value> = inner
            .recent
            .iter()
            .rev()
            .take(10)
            .map(|e| {
                serde_json::json!({
                    "code": e.code,
                    "message": e.message,
                    "endpoint": e.endpoint,
                    "timestamp": e.timestamp,
                })
            })
            .collect();

        serde_json::json!({
            "total_errors": total,
            "by_code": by_code,
            "by_category": by_category,
            "recent_errors": recent,
        })
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.counts.clear();
        inner.recent.clear();
    }
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_covers_every_class() {
        assert_eq!(ErrorCode::MissingParam.http_status(), 400);
        assert_eq!(ErrorCode::AuthRequired.http_status(), 401);
        assert_eq!(ErrorCode::AdminRequired.http_status(), 403);
        assert_eq!(ErrorCode::PlayerNotFound.http_status(), 404);
        assert_eq!(ErrorCode::NbaApiRateLimited.http_status(), 429);
        assert_eq!(ErrorCode::UnknownError.http_status(), 500);
        assert_eq!(ErrorCode::UpstreamError.http_status(), 502);
        assert_eq!(ErrorCode::AiDown.http_status(), 503);
        assert_eq!(ErrorCode::SimulationTimeout.http_status(), 504);
    }

    #[test]
    fn classify_rate_limit_and_timeout() {
        let (code, _, _) = classify_fault("ApiError", "HTTP 429 Too Many Requests");
        assert_eq!(code, ErrorCode::NbaApiRateLimited);
        assert!(code.triggers_cooldown());

        let (code, _, _) = classify_fault("TimeoutError", "request timed out");
        assert_eq!(code, ErrorCode::NbaApiTimeout);

        let (code, _, _) = classify_fault("TimeoutError", "ai triage timed out");
        assert_eq!(code, ErrorCode::AiTimeout);
    }

    #[test]
    fn classify_not_found_by_entity() {
        let (code, _, _) = classify_fault("LookupError", "player 203999 not found");
        assert_eq!(code, ErrorCode::PlayerNotFound);
        let (code, _, _) = classify_fault("LookupError", "team XYZ not found");
        assert_eq!(code, ErrorCode::TeamNotFound);
    }

    #[test]
    fn classify_unknown_defaults() {
        let (code, message, _) = classify_fault("WeirdError", "something inexplicable");
        assert_eq!(code, ErrorCode::UnknownError);
        assert!(message.contains("WeirdError"));
    }

    #[test]
    fn error_log_keeps_last_100() {
        let log = ErrorLog::new();
        for i in 0..150 {
            log.record(&NexusError::new(
                ErrorCode::UnknownError,
                format!("err {i}"),
                "/t",
            ));
        }
        let stats = log.stats();
        assert_eq!(stats["total_errors"], 150);
        assert_eq!(stats["by_category"]["5xx"], 150);
        // Ring retains only the newest 100; recent view shows the last 10.
        assert_eq!(stats["recent_errors"].as_array().unwrap().len(), 10);
        assert_eq!(stats["recent_errors"][0]["message"], "err 149");
    }
}
