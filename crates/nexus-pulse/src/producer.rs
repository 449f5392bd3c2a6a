//! Live pulse producer - timer-driven enrichment loop
//!
//! Each cycle: one scoreboard call, a concurrent boxscore fan-out over the
//! live games, per-player metric enrichment, and document-store writes for
//! every game plus the global leaderboard. The loop is fail-safe: cycle
//! errors are logged and counted, never fatal, and the poll interval holds.

use crate::metrics;
use crate::sports_api::{BoxScore, GameStatus, GameSummary, SeasonBaselines, SportsApi};
use chrono::Utc;
use futures::future::join_all;
use nexus_common::config::PulseConfig;
use nexus_common::Result;
use nexus_store::DocumentStore;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// Latest snapshot holder plus loop bookkeeping.
pub struct PulseProducer {
    api: Arc<dyn SportsApi + Send + Sync>,
    docs: Arc<dyn DocumentStore + Send + Sync>,
    baselines: Arc<dyn SeasonBaselines + Send + Sync>,
    config: PulseConfig,
    snapshot: RwLock<Option<serde_json::Value>>,
    running: AtomicBool,
    update_count: AtomicU64,
    store_write_errors: Arc<AtomicU64>,
    last_update_secs: RwLock<f64>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PulseProducer {
    pub fn new(
        api: Arc<dyn SportsApi + Send + Sync>,
        docs: Arc<dyn DocumentStore + Send + Sync>,
        baselines: Arc<dyn SeasonBaselines + Send + Sync>,
        config: PulseConfig,
    ) -> Arc<Self> {
        Arc::new(PulseProducer {
            api,
            docs,
            baselines,
            config,
            snapshot: RwLock::new(None),
            running: AtomicBool::new(false),
            update_count: AtomicU64::new(0),
            store_write_errors: Arc::new(AtomicU64::new(0)),
            last_update_secs: RwLock::new(0.0),
            task: Mutex::new(None),
        })
    }

    /// Start the producer loop.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let producer = self.clone();
        *self.task.lock() = Some(tokio::spawn(async move {
            info!(
                interval_secs = producer.config.poll_interval_secs,
                "Pulse producer started"
            );
            while producer.running.load(Ordering::SeqCst) {
                let started = Instant::now();
                if let Err(e) = producer.update_cycle().await {
                    error!(error = %e, "Pulse cycle failed");
                }
                *producer.last_update_secs.write() = started.elapsed().as_secs_f64();

                // The interval holds no matter how the cycle went.
                tokio::time::sleep(std::time::Duration::from_secs(
                    producer.config.poll_interval_secs,
                ))
                .await;
            }
        }));
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        info!("Pulse producer stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Latest full-cycle snapshot, if one has landed.
    pub fn latest_snapshot(&self) -> Option<serde_json::Value> {
        self.snapshot.read().clone()
    }

    /// Status surface for `/live/status`.
    pub fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "running": self.is_running(),
            "update_count": self.update_count.load(Ordering::SeqCst),
            "last_update_duration_seconds": *self.last_update_secs.read(),
            "poll_interval_seconds": self.config.poll_interval_secs,
            "store_write_errors": self.store_write_errors.load(Ordering::SeqCst),
            "snapshot_available": self.snapshot.read().is_some(),
        })
    }

    /// One full cycle: scoreboard, boxscore fan-out, enrichment, writes.
    pub async fn update_cycle(self: &Arc<Self>) -> Result<()> {
        let games = self.api.fetch_scoreboard().await?;
        let live: Vec<&GameSummary> =
            games.iter().filter(|g| g.status == GameStatus::Live).collect();

        if live.is_empty() {
            debug!("No live games this cycle");
        }

        // Concurrent boxscore fan-out, bounded by the count of live games.
        let boxscores = join_all(
            live.iter()
                .map(|game| self.api.fetch_boxscore(&game.game_id)),
        )
        .await;

        let mut game_states = Vec::new();
        let mut all_leaders: Vec<serde_json::Value> = Vec::new();

        for (game, boxscore) in live.iter().zip(boxscores) {
            let boxscore = match boxscore {
                Ok(b) => b,
                Err(e) => {
                    error!(game_id = %game.game_id, error = %e, "Boxscore fetch failed");
                    continue;
                }
            };

            let leaders = self.enrich_game(game, &boxscore).await;
            all_leaders.extend(leaders.iter().cloned());

            let garbage = metrics::is_garbage_time(
                game.period,
                &game.clock,
                game.home_score,
                game.away_score,
            );
            let margin = (game.home_score - game.away_score).abs();
            let pace = metrics::pace_multiplier(
                self.baselines.team_pace(&game.home_team).await,
                self.baselines.team_pace(&game.away_team).await,
                self.config.league_avg_pace,
            );

            let game_state = serde_json::json!({
                "game_id": game.game_id,
                "home_team": game.home_team,
                "away_team": game.away_team,
                "home_score": game.home_score,
                "away_score": game.away_score,
                "clock": game.status_text,
                "period": game.period,
                "status": game.status,
                "is_garbage_time": garbage,
                "game_phase": metrics::game_phase(game.period, margin, garbage),
                "score_margin": margin,
                "pace_multiplier": pace,
                "leaders": leaders
                    .into_iter()
                    .take(self.config.top_leaders)
                    .collect::<Vec<_>>(),
            });

            self.write_detached("live_games", &game.game_id, game_state.clone());
            game_states.push(game_state);
        }

        // Global leaderboard across all live games.
        all_leaders.sort_by(|a, b| {
            b["pie"]
                .as_f64()
                .unwrap_or(0.0)
                .partial_cmp(&a["pie"].as_f64().unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        all_leaders.truncate(self.config.top_leaders);
        if !all_leaders.is_empty() {
            self.write_detached(
                "live_leaders",
                "latest",
                serde_json::json!({ "leaders": all_leaders, "timestamp": Utc::now() }),
            );
        }

        let cycle = self.update_count.fetch_add(1, Ordering::SeqCst) + 1;
        let changes = self.diff_changes(&all_leaders);

        // The snapshot becomes visible only once the whole cycle assembled.
        *self.snapshot.write() = Some(serde_json::json!({
            "games": game_states,
            "leaders": all_leaders,
            "meta": {
                "timestamp": Utc::now(),
                "update_cycle": cycle,
                "game_count": games.len(),
                "live_count": live.len(),
            },
            "changes": changes,
        }));

        Ok(())
    }

    /// Per-player enrichment for one game, sorted by PIE descending.
    async fn enrich_game(
        &self,
        game: &GameSummary,
        boxscore: &BoxScore,
    ) -> Vec<serde_json::Value> {
        let home_totals = metrics::TeamTotals {
            pts: boxscore.home.pts,
            fgm: boxscore.home.fgm,
            fga: boxscore.home.fga,
            ftm: boxscore.home.ftm,
            fta: boxscore.home.fta,
            tov: boxscore.home.tov,
        };
        let away_totals = metrics::TeamTotals {
            pts: boxscore.away.pts,
            fgm: boxscore.away.fgm,
            fga: boxscore.away.fga,
            ftm: boxscore.away.ftm,
            fta: boxscore.away.fta,
            tov: boxscore.away.tov,
        };
        let game_total = metrics::game_pie_denominator(&[home_totals, away_totals]);
        let elapsed_minutes = (game.period.min(4) as f64) * 12.0
            + if game.period > 4 {
                (game.period - 4) as f64 * 5.0
            } else {
                0.0
            };

        let garbage = metrics::is_garbage_time(
            game.period,
            &game.clock,
            game.home_score,
            game.away_score,
        );

        let mut leaders = Vec::new();
        for player in boxscore.active_players() {
            let minutes = metrics::parse_minutes(&player.minutes);
            let opponent = if player.team == game.home_team {
                &game.away_team
            } else {
                &game.home_team
            };
            let team_line = boxscore.team_line(&player.team);

            let pie = metrics::live_pie(
                player.pts, player.fgm, player.fga, player.ftm, player.fta, player.oreb,
                player.dreb, player.ast, player.stl, player.blk, player.pf, player.tov,
                game_total,
            );

            let ts_pct = metrics::true_shooting(player.pts, player.fga, player.fta);
            let efg_pct = metrics::effective_fg(player.fgm, player.fg3m, player.fga);
            let (pm_per_min, pm_label) =
                metrics::plus_minus_per_min(player.plus_minus, minutes);

            let ast_rate = team_line
                .map(|t| {
                    metrics::assist_rate(player.ast, minutes, t.fgm, player.fgm, elapsed_minutes * 5.0)
                })
                .unwrap_or(0.0);

            let usage_rate = team_line
                .map(|t| {
                    metrics::in_game_usage(
                        player.fga, player.fta, player.tov, minutes,
                        t.fga, t.fta, t.tov, elapsed_minutes,
                    )
                })
                .unwrap_or(0.0);

            let season_usage = self.baselines.player_season_usage(&player.player_id).await;
            let season_ts = self.baselines.player_rolling_ts(&player.player_id).await;
            let def_rating = self
                .baselines
                .team_defense_rating(opponent)
                .await
                .unwrap_or(self.config.league_avg_def_rating);

            leaders.push(serde_json::json!({
                "player_id": player.player_id,
                "name": player.name,
                "team": player.team,
                "opponent": opponent,
                "minutes": player.minutes,
                "pie": pie,
                "pie_percentile": metrics::pie_percentile(pie),
                "ts_pct": ts_pct,
                "efg_pct": efg_pct,
                "plus_minus": player.plus_minus,
                "pm_per_min": pm_per_min,
                "pm_label": pm_label,
                "ast_rate": ast_rate,
                "fatigue_penalty": metrics::in_game_fatigue_penalty(minutes, 25),
                "pts_per_36": metrics::per_36(player.pts, minutes),
                "reb_per_36": metrics::per_36(player.reb, minutes),
                "usage_rate": usage_rate,
                "usage_vacuum": metrics::usage_vacuum(usage_rate / 100.0, season_usage),
                "opponent_def_rating": def_rating,
                "matchup_difficulty": metrics::matchup_difficulty(
                    def_rating,
                    self.config.league_avg_def_rating,
                ),
                "season_avg_ts": season_ts,
                "heat_scale": metrics::heat_scale(ts_pct, season_ts),
                "is_garbage_time": garbage,
                "stats": {
                    "pts": player.pts,
                    "reb": player.reb,
                    "ast": player.ast,
                    "stl": player.stl,
                    "blk": player.blk,
                    "fg3m": player.fg3m,
                    "fgm": player.fgm,
                    "fga": player.fga,
                    "ftm": player.ftm,
                    "fta": player.fta,
                    "oreb": player.oreb,
                    "dreb": player.dreb,
                    "pf": player.pf,
                    "tov": player.tov,
                },
            }));
        }

        leaders.sort_by(|a, b| {
            b["pie"]
                .as_f64()
                .unwrap_or(0.0)
                .partial_cmp(&a["pie"].as_f64().unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        leaders
    }

    /// Fire-and-forget document write; failures count, never propagate.
    fn write_detached(&self, collection: &str, id: &str, doc: serde_json::Value) {
        let docs = self.docs.clone();
        let errors = self.store_write_errors.clone();
        let collection = collection.to_string();
        let id = id.to_string();
        tokio::spawn(async move {
            if let Err(e) = docs.upsert(&collection, &id, doc).await {
                errors.fetch_add(1, Ordering::SeqCst);
                error!(collection = %collection, id = %id, error = %e, "Pulse store write failed");
            }
        });
    }

    /// Stat deltas against the previous snapshot's leaders, keyed by player.
    fn diff_changes(&self, leaders: &[serde_json::Value]) -> serde_json::Value {
        let previous = self.snapshot.read().clone();
        let Some(previous) = previous else {
            return serde_json::json!({});
        };
        let empty = Vec::new();
        let prev_leaders = previous["leaders"].as_array().unwrap_or(&empty);

        let mut changes = serde_json::Map::new();
        for leader in leaders {
            let id = leader["player_id"].as_str().unwrap_or_default();
            let Some(prev) = prev_leaders
                .iter()
                .find(|p| p["player_id"].as_str() == Some(id))
            else {
                continue;
            };

            let mut changed = Vec::new();
            for stat in ["pts", "reb", "ast", "stl", "blk", "fg3m"] {
                if leader["stats"][stat] != prev["stats"][stat] {
                    changed.push(serde_json::Value::String(stat.to_string()));
                }
            }
            if !changed.is_empty() {
                changes.insert(id.to_string(), serde_json::Value::Array(changed));
            }
        }
        serde_json::Value::Object(changes)
    }
}

impl Drop for PulseProducer {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sports_api::{PlayerLine, StoreBaselines, TeamLine};
    use async_trait::async_trait;
    use nexus_common::{ErrorCode, NexusConfig, NexusError};
    use nexus_store::{MemoryDocumentStore, DocumentStore};
    use parking_lot::Mutex as PlMutex;

    struct FakeApi {
        games: Vec<GameSummary>,
        boxscores: PlMutex<std::collections::HashMap<String, BoxScore>>,
        fail_scoreboard: AtomicBool,
    }

    #[async_trait]
    impl SportsApi for FakeApi {
        async fn fetch_scoreboard(&self) -> Result<Vec<GameSummary>> {
            if self.fail_scoreboard.load(Ordering::SeqCst) {
                return Err(NexusError::new(
                    ErrorCode::NbaApiDown,
                    "scoreboard unavailable",
                    "/live",
                ));
            }
            Ok(self.games.clone())
        }

        async fn fetch_boxscore(&self, game_id: &str) -> Result<BoxScore> {
            self.boxscores
                .lock()
                .get(game_id)
                .cloned()
                .ok_or_else(|| NexusError::new(ErrorCode::GameNotFound, "no boxscore", "/live"))
        }
    }

    fn live_game() -> GameSummary {
        GameSummary {
            game_id: "g1".to_string(),
            home_team: "BOS".to_string(),
            away_team: "MIA".to_string(),
            home_score: 88,
            away_score: 84,
            period: 4,
            clock: "4:30".to_string(),
            status: GameStatus::Live,
            status_text: "Q4 4:30".to_string(),
        }
    }

    fn player(id: &str, team: &str, pts: i64) -> PlayerLine {
        PlayerLine {
            player_id: id.to_string(),
            name: format!("Player {id}"),
            team: team.to_string(),
            minutes: "30:00".to_string(),
            pts,
            fgm: pts / 3,
            fga: pts / 2,
            fg3m: 2,
            ftm: 4,
            fta: 5,
            oreb: 1,
            dreb: 5,
            reb: 6,
            ast: 6,
            stl: 1,
            blk: 1,
            pf: 2,
            tov: 2,
            plus_minus: 8,
        }
    }

    fn boxscore() -> BoxScore {
        BoxScore {
            game_id: "g1".to_string(),
            home: TeamLine {
                team: "BOS".to_string(),
                pts: 88,
                fgm: 33,
                fga: 70,
                ftm: 14,
                fta: 18,
                tov: 10,
            },
            away: TeamLine {
                team: "MIA".to_string(),
                pts: 84,
                fgm: 31,
                fga: 72,
                ftm: 15,
                fta: 19,
                tov: 12,
            },
            players: vec![
                player("p1", "BOS", 31),
                player("p2", "MIA", 24),
                player("p3", "BOS", 12),
            ],
        }
    }

    fn producer(api: FakeApi, docs: Arc<MemoryDocumentStore>) -> Arc<PulseProducer> {
        let baselines = Arc::new(StoreBaselines::new(docs.clone(), "2025-26"));
        PulseProducer::new(
            Arc::new(api),
            docs,
            baselines,
            NexusConfig::default().pulse,
        )
    }

    fn fake_api() -> FakeApi {
        let mut boxscores = std::collections::HashMap::new();
        boxscores.insert("g1".to_string(), boxscore());
        FakeApi {
            games: vec![live_game()],
            boxscores: PlMutex::new(boxscores),
            fail_scoreboard: AtomicBool::new(false),
        }
    }

    #[tokio::test]
    async fn cycle_builds_snapshot_with_enriched_leaders() {
        let docs = Arc::new(MemoryDocumentStore::new());
        let producer = producer(fake_api(), docs.clone());

        producer.update_cycle().await.unwrap();

        let snapshot = producer.latest_snapshot().expect("snapshot");
        assert_eq!(snapshot["meta"]["update_cycle"], 1);
        assert_eq!(snapshot["meta"]["live_count"], 1);
        assert_eq!(snapshot["games"].as_array().unwrap().len(), 1);

        let game = &snapshot["games"][0];
        // Q4, margin 4: clutch.
        assert_eq!(game["game_phase"], "clutch");
        assert_eq!(game["is_garbage_time"], false);

        let leaders = snapshot["leaders"].as_array().unwrap();
        assert!(!leaders.is_empty());
        // Sorted by PIE descending.
        let first = leaders[0]["pie"].as_f64().unwrap();
        let last = leaders[leaders.len() - 1]["pie"].as_f64().unwrap();
        assert!(first >= last);
        // Enrichment fields present.
        assert!(leaders[0]["ts_pct"].as_f64().is_some());
        assert!(leaders[0]["pm_label"].is_string());
        assert!(leaders[0]["matchup_difficulty"].is_string());

        // Game document written to the store.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(docs.get("live_games", "g1").await.unwrap().is_some());
        assert!(docs.get("live_leaders", "latest").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn scoreboard_failure_does_not_poison_the_producer() {
        let api = fake_api();
        api.fail_scoreboard.store(true, Ordering::SeqCst);
        let docs = Arc::new(MemoryDocumentStore::new());
        let producer = producer(api, docs);

        assert!(producer.update_cycle().await.is_err());
        assert!(producer.latest_snapshot().is_none());

        let status = producer.status();
        assert_eq!(status["update_count"], 0);
    }

    #[tokio::test]
    async fn store_write_failures_count_but_do_not_stop_the_cycle() {
        let docs = Arc::new(MemoryDocumentStore::new());
        let baselines = Arc::new(StoreBaselines::new(docs.clone(), "2025-26"));
        let producer = PulseProducer::new(
            Arc::new(fake_api()),
            docs.clone(),
            baselines,
            NexusConfig::default().pulse,
        );

        docs.set_available(false);
        producer.update_cycle().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let status = producer.status();
        assert!(status["store_write_errors"].as_u64().unwrap() >= 1);
        // Snapshot still landed in memory.
        assert!(producer.latest_snapshot().is_some());
    }

    #[tokio::test]
    async fn changes_track_stat_deltas_between_cycles() {
        let docs = Arc::new(MemoryDocumentStore::new());
        let api = fake_api();
        let producer = producer(api, docs);

        producer.update_cycle().await.unwrap();
        assert_eq!(producer.latest_snapshot().unwrap()["changes"], serde_json::json!({}));

        // Same data again: no changes recorded.
        producer.update_cycle().await.unwrap();
        assert_eq!(producer.latest_snapshot().unwrap()["changes"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn garbage_time_classification_flows_into_the_game_state() {
        let mut game = live_game();
        game.home_score = 130;
        game.away_score = 92;
        game.clock = "5:00".to_string();
        let mut boxscores = std::collections::HashMap::new();
        boxscores.insert("g1".to_string(), boxscore());
        let api = FakeApi {
            games: vec![game],
            boxscores: PlMutex::new(boxscores),
            fail_scoreboard: AtomicBool::new(false),
        };

        let docs = Arc::new(MemoryDocumentStore::new());
        let producer = producer(api, docs);
        producer.update_cycle().await.unwrap();

        let snapshot = producer.latest_snapshot().unwrap();
        assert_eq!(snapshot["games"][0]["is_garbage_time"], true);
        assert_eq!(snapshot["games"][0]["game_phase"], "garbage");
    }
}
