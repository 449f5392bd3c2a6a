//! Sports API seam and season baselines
//!
//! The external scoreboard/boxscore provider sits behind [`SportsApi`];
//! season baselines (defensive ratings, pace, usage, rolling TS%) are read
//! through [`SeasonBaselines`] over the shared document store.

use async_trait::async_trait;
use nexus_common::Result;
use nexus_store::DocumentStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Game status on the scoreboard.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum GameStatus {
    Scheduled,
    Live,
    Final,
}

/// One scoreboard row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameSummary {
    pub game_id: String,
    pub home_team: String,
    pub away_team: String,
    pub home_score: i64,
    pub away_score: i64,
    pub period: u32,
    /// Clock string, "MM:SS" or ISO-8601 duration
    pub clock: String,
    pub status: GameStatus,
    pub status_text: String,
}

/// One player line from a boxscore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerLine {
    pub player_id: String,
    pub name: String,
    pub team: String,
    pub minutes: String,
    pub pts: i64,
    pub fgm: i64,
    pub fga: i64,
    pub fg3m: i64,
    pub ftm: i64,
    pub fta: i64,
    pub oreb: i64,
    pub dreb: i64,
    pub reb: i64,
    pub ast: i64,
    pub stl: i64,
    pub blk: i64,
    pub pf: i64,
    pub tov: i64,
    pub plus_minus: i64,
}

/// Team stat totals within a boxscore.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeamLine {
    pub team: String,
    pub pts: i64,
    pub fgm: i64,
    pub fga: i64,
    pub ftm: i64,
    pub fta: i64,
    pub tov: i64,
}

/// Normalized boxscore for one game.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoxScore {
    pub game_id: String,
    pub home: TeamLine,
    pub away: TeamLine,
    pub players: Vec<PlayerLine>,
}

impl BoxScore {
    /// Players with any floor time this game.
    pub fn active_players(&self) -> impl Iterator<Item = &PlayerLine> {
        self.players
            .iter()
            .filter(|p| crate::metrics::parse_minutes(&p.minutes) > 0.0)
    }

    pub fn team_line(&self, team: &str) -> Option<&TeamLine> {
        if self.home.team == team {
            Some(&self.home)
        } else if self.away.team == team {
            Some(&self.away)
        } else {
            None
        }
    }
}

/// External live data provider.
#[async_trait]
pub trait SportsApi {
    /// Fetch the current scoreboard. One external call per cycle.
    async fn fetch_scoreboard(&self) -> Result<Vec<GameSummary>>;

    /// Fetch the boxscore for one game.
    async fn fetch_boxscore(&self, game_id: &str) -> Result<BoxScore>;
}

/// Season baseline reads for enrichment.
#[async_trait]
pub trait SeasonBaselines {
    async fn player_season_usage(&self, player_id: &str) -> Option<f64>;
    async fn player_rolling_ts(&self, player_id: &str) -> Option<f64>;
    async fn team_defense_rating(&self, team: &str) -> Option<f64>;
    async fn team_pace(&self, team: &str) -> Option<f64>;
}

/// Document-store-backed baselines, one collection per season and entity.
pub struct StoreBaselines {
    docs: Arc<dyn DocumentStore + Send + Sync>,
    season: String,
}

impl StoreBaselines {
    pub fn new(docs: Arc<dyn DocumentStore + Send + Sync>, season: impl Into<String>) -> Self {
        StoreBaselines {
            docs,
            season: season.into(),
        }
    }

    fn players_collection(&self) -> String {
        format!("season_baselines/{}/players", self.season)
    }

    fn teams_collection(&self) -> String {
        format!("season_baselines/{}/teams", self.season)
    }

    async fn player_field(&self, player_id: &str, field: &str) -> Option<f64> {
        self.docs
            .get(&self.players_collection(), player_id)
            .await
            .ok()
            .flatten()
            .and_then(|doc| doc[field].as_f64())
    }

    async fn team_field(&self, team: &str, field: &str) -> Option<f64> {
        self.docs
            .get(&self.teams_collection(), team)
            .await
            .ok()
            .flatten()
            .and_then(|doc| doc[field].as_f64())
    }
}

#[async_trait]
impl SeasonBaselines for StoreBaselines {
    async fn player_season_usage(&self, player_id: &str) -> Option<f64> {
        self.player_field(player_id, "usage_pct").await
    }

    async fn player_rolling_ts(&self, player_id: &str) -> Option<f64> {
        self.player_field(player_id, "ts_pct").await
    }

    async fn team_defense_rating(&self, team: &str) -> Option<f64> {
        self.team_field(team, "def_rating").await
    }

    async fn team_pace(&self, team: &str) -> Option<f64> {
        self.team_field(team, "pace").await
    }
}
