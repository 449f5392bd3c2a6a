//! Nexus Pulse - Live data pulse producer
//!
//! A single long-running loop fans hot game data into the document store:
//! scoreboard poll, concurrent boxscore fetches, per-player metric
//! enrichment, and snapshot assembly for the SSE and REST surfaces.

pub mod metrics;
mod producer;
mod sports_api;

pub use producer::PulseProducer;
pub use sports_api::{
    BoxScore, GameStatus, GameSummary, PlayerLine, SeasonBaselines, SportsApi, StoreBaselines,
    TeamLine,
};
