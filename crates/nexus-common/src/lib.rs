//! Nexus Common - Shared types and utilities for the Nexus-Vanguard control plane

pub mod config;
pub mod error;
pub mod types;

pub use config::NexusConfig;
pub use error::{ErrorCode, ErrorLog, NexusError, Result};
pub use types::{Priority, RequestId, Severity, VanguardMode};
