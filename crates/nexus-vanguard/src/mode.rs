//! Operating mode state with logged transitions

use chrono::{DateTime, Utc};
use nexus_common::VanguardMode;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct ModeTransition {
    pub from: VanguardMode,
    pub to: VanguardMode,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Shared holder for the current operating mode.
pub struct ModeState {
    current: RwLock<VanguardMode>,
    last_transition: RwLock<Option<ModeTransition>>,
}

impl ModeState {
    pub fn new(initial: VanguardMode) -> Self {
        ModeState {
            current: RwLock::new(initial),
            last_transition: RwLock::new(None),
        }
    }

    pub fn get(&self) -> VanguardMode {
        *self.current.read()
    }

    /// Transition to a new mode. No-op when already there.
    pub fn set(&self, target: VanguardMode, reason: &str) -> bool {
        let mut current = self.current.write();
        if *current == target {
            return false;
        }

        let transition = ModeTransition {
            from: *current,
            to: target,
            reason: reason.to_string(),
            at: Utc::now(),
        };

        // Escalations are warnings; de-escalations are informational.
        if target == VanguardMode::CircuitBreaker || target == VanguardMode::FullSovereign {
            warn!(from = %transition.from, to = %target, reason, "MODE ESCALATION");
        } else {
            info!(from = %transition.from, to = %target, reason, "MODE DE-ESCALATION");
        }

        *current = target;
        *self.last_transition.write() = Some(transition);
        true
    }

    pub fn last_transition(&self) -> Option<ModeTransition> {
        self.last_transition.read().clone()
    }
}
