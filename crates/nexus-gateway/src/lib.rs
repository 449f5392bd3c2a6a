//! Nexus Gateway - HTTP supervisor for the Nexus-Vanguard control plane
//!
//! Binds the endpoint registry, adaptive router, traffic limits, incident
//! engine, and pulse producer behind one axum server with the ordered
//! middleware stack: request-id, rate limiting, idempotency, incident
//! capture.

mod admin;
mod handlers;
mod live;
mod middleware;
mod server;
mod supervisor;

pub use handlers::{build_router, ApiError, LIVE_ROUTE_COUNT};
pub use middleware::{RateLimitLayer, RequestIdExt, RequestIdLayer};
pub use server::serve;
pub use supervisor::{OfflineScoreboard, SimulationBackend, StubSimulation, Supervisor};
