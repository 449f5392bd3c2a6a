//! Nexus Router - Adaptive routing with cache/live racing
//!
//! Three cooperating pieces: the [`AdaptiveRouter`] recommends a strategy per
//! request, the [`ShadowRace`] executes races with a patience budget while
//! keeping the losing live branch alive, and the [`SseBroadcaster`] fans late
//! arrivals out to listening clients.

mod adaptive_router;
mod broadcaster;
mod shadow_race;

pub use adaptive_router::{AdaptiveRouter, RouteContext, RouteDecision, RouteStrategy};
pub use broadcaster::{ListenerQueue, SseBroadcaster, SseEvent};
pub use shadow_race::{DataSource, LateArrival, ShadowRace, ShadowRaceResult};
