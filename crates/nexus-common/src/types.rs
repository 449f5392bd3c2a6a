//! Common types shared across the Nexus-Vanguard components

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for requests, propagated via `X-Request-ID`
pub type RequestId = Uuid;

/// Priority levels for queued work. Lower ordinal = more urgent.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical = 0,
    High = 1,
    Medium = 2,
    Low = 3,
    Background = 4,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
            Priority::Background => "background",
        }
    }

    /// All priorities, most urgent first.
    pub fn all() -> [Priority; 5] {
        [
            Priority::Critical,
            Priority::High,
            Priority::Medium,
            Priority::Low,
            Priority::Background,
        ]
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            "background" => Ok(Priority::Background),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Vanguard operating modes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum VanguardMode {
    /// Log only, no remedial actions
    #[serde(rename = "SILENT_OBSERVER")]
    SilentObserver,
    /// Quarantine and rate-limit decisions allowed
    #[serde(rename = "CIRCUIT_BREAKER")]
    CircuitBreaker,
    /// Full autonomous remediation
    #[serde(rename = "FULL_SOVEREIGN")]
    FullSovereign,
}

impl VanguardMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VanguardMode::SilentObserver => "SILENT_OBSERVER",
            VanguardMode::CircuitBreaker => "CIRCUIT_BREAKER",
            VanguardMode::FullSovereign => "FULL_SOVEREIGN",
        }
    }
}

impl std::str::FromStr for VanguardMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "SILENT_OBSERVER" => Ok(VanguardMode::SilentObserver),
            "CIRCUIT_BREAKER" => Ok(VanguardMode::CircuitBreaker),
            "FULL_SOVEREIGN" => Ok(VanguardMode::FullSovereign),
            other => Err(format!("unknown vanguard mode: {other}")),
        }
    }
}

impl std::fmt::Display for VanguardMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incident severity levels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    #[serde(rename = "GREEN")]
    Green,
    #[serde(rename = "YELLOW")]
    Yellow,
    #[serde(rename = "AMBER")]
    Amber,
    #[serde(rename = "RED")]
    Red,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Green => "GREEN",
            Severity::Yellow => "YELLOW",
            Severity::Amber => "AMBER",
            Severity::Red => "RED",
        }
    }
}
