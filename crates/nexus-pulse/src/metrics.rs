//! Pure in-game metric functions
//!
//! No I/O anywhere in this module; everything takes parsed stat values and
//! returns a number or a label. The pulse producer composes these per player
//! per cycle.

/// Player impact estimate against a real game-wide denominator.
///
/// Numerator counts every positive and negative contribution; the result is
/// clamped to [-0.5, 1.0] and rounded to three decimals.
#[allow(clippy::too_many_arguments)]
pub fn live_pie(
    pts: i64,
    fgm: i64,
    fga: i64,
    ftm: i64,
    fta: i64,
    oreb: i64,
    dreb: i64,
    ast: i64,
    stl: i64,
    blk: i64,
    pf: i64,
    tov: i64,
    game_total: f64,
) -> f64 {
    if game_total <= 0.0 {
        return 0.0;
    }

    let numerator = pts as f64 + fgm as f64 + ftm as f64 - fga as f64 - fta as f64
        + dreb as f64
        + 0.5 * oreb as f64
        + ast as f64
        + stl as f64
        + 0.5 * blk as f64
        - pf as f64
        - tov as f64;

    round3((numerator / game_total).clamp(-0.5, 1.0))
}

/// Combined contribution of both teams, floored at 10 so early-game
/// denominators stay sane.
pub fn game_pie_denominator(teams: &[TeamTotals]) -> f64 {
    let total: f64 = teams
        .iter()
        .map(|t| {
            (t.pts + t.fgm + t.ftm - t.fga - t.fta - t.tov) as f64
        })
        .sum();
    total.max(10.0)
}

/// Team stat totals used by rate metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct TeamTotals {
    pub pts: i64,
    pub fgm: i64,
    pub fga: i64,
    pub ftm: i64,
    pub fta: i64,
    pub tov: i64,
}

/// League percentile for a PIE value.
pub fn pie_percentile(pie: f64) -> u8 {
    if pie >= 0.20 {
        99
    } else if pie >= 0.15 {
        90 + ((pie - 0.15) / 0.05 * 9.0) as u8
    } else if pie >= 0.12 {
        75 + ((pie - 0.12) / 0.03 * 15.0) as u8
    } else if pie >= 0.08 {
        50 + ((pie - 0.08) / 0.04 * 25.0) as u8
    } else if pie >= 0.05 {
        25 + ((pie - 0.05) / 0.03 * 25.0) as u8
    } else {
        ((pie / 0.05 * 25.0) as u8).max(1)
    }
}

/// True shooting percentage.
pub fn true_shooting(pts: i64, fga: i64, fta: i64) -> f64 {
    let denominator = 2.0 * (fga as f64 + 0.44 * fta as f64);
    if denominator <= 0.0 {
        return 0.0;
    }
    round4(pts as f64 / denominator)
}

/// Effective field goal percentage.
pub fn effective_fg(fgm: i64, fg3m: i64, fga: i64) -> f64 {
    if fga <= 0 {
        return 0.0;
    }
    round4((fgm as f64 + 0.5 * fg3m as f64) / fga as f64)
}

/// Plus-minus per minute with its categorical label.
pub fn plus_minus_per_min(plus_minus: i64, minutes: f64) -> (f64, &'static str) {
    let per_min = if minutes > 0.0 {
        round3(plus_minus as f64 / minutes)
    } else {
        0.0
    };
    let label = if per_min > 0.5 {
        "dominant"
    } else if per_min > 0.0 {
        "positive"
    } else if per_min > -0.5 {
        "negative"
    } else {
        "liability"
    };
    (per_min, label)
}

/// Assist percentage: share of teammate field goals assisted while on floor.
pub fn assist_rate(
    ast: i64,
    minutes: f64,
    team_fgm: i64,
    player_fgm: i64,
    team_minutes: f64,
) -> f64 {
    if minutes <= 0.0 || team_minutes <= 0.0 {
        return 0.0;
    }
    let teammate_fgm = (minutes / (team_minutes / 5.0)) * team_fgm as f64 - player_fgm as f64;
    if teammate_fgm <= 0.0 {
        return 0.0;
    }
    round4(ast as f64 / teammate_fgm)
}

/// Per-36-minute normalization.
pub fn per_36(value: i64, minutes: f64) -> f64 {
    if minutes <= 0.0 {
        return 0.0;
    }
    round1(value as f64 / minutes * 36.0)
}

/// In-game fatigue accumulates at 1% per 8 continuous minutes, faster for
/// older players, capped at 15%.
pub fn in_game_fatigue_penalty(continuous_minutes: f64, age: u8) -> f64 {
    let age_modifier = if age >= 35 {
        1.5
    } else if age >= 30 {
        1.25
    } else {
        1.0
    };
    let penalty = continuous_minutes / 8.0 * 0.01 * age_modifier;
    round4(penalty.min(0.15))
}

/// Live usage rate over elapsed game minutes, as a percentage.
#[allow(clippy::too_many_arguments)]
pub fn in_game_usage(
    fga: i64,
    fta: i64,
    tov: i64,
    minutes: f64,
    team_fga: i64,
    team_fta: i64,
    team_tov: i64,
    elapsed_game_minutes: f64,
) -> f64 {
    if minutes <= 0.0 {
        return 0.0;
    }
    let team_possessions = team_fga as f64 + 0.44 * team_fta as f64 + team_tov as f64;
    if team_possessions <= 0.0 {
        return 0.0;
    }
    let player_possessions = fga as f64 + 0.44 * fta as f64 + tov as f64;
    round2(100.0 * (player_possessions * elapsed_game_minutes) / (minutes * team_possessions))
}

/// Usage vacuum: the player is absorbing clearly more possessions than the
/// season baseline suggests.
pub fn usage_vacuum(live_usage: f64, season_usage: Option<f64>) -> bool {
    match season_usage {
        Some(season) => live_usage - season >= 0.05,
        None => false,
    }
}

/// Matchup difficulty from opponent defensive rating against league average.
/// A lower rating is a stingier defense.
pub fn matchup_difficulty(opponent_def_rating: f64, league_avg: f64) -> &'static str {
    if opponent_def_rating <= league_avg - 3.0 {
        "elite"
    } else if opponent_def_rating >= league_avg + 3.0 {
        "soft"
    } else {
        "average"
    }
}

/// Heat scale: live shooting efficiency against the season's rolling TS%.
pub fn heat_scale(live_ts: f64, season_ts: Option<f64>) -> &'static str {
    let Some(season) = season_ts else {
        return "steady";
    };
    if live_ts >= season + 0.05 {
        "hot"
    } else if live_ts <= season - 0.05 {
        "cold"
    } else {
        "steady"
    }
}

/// Garbage time: a late-game margin no comeback realistically closes.
pub fn is_garbage_time(period: u32, clock: &str, home_score: i64, away_score: i64) -> bool {
    if period < 4 {
        return false;
    }
    let margin = (home_score - away_score).abs();
    if margin >= 35 {
        return true;
    }
    margin >= 25 && clock_minutes_remaining(clock) < 6.0
}

/// Game phase classification. The garbage flag wins outright.
pub fn game_phase(period: u32, score_margin: i64, garbage: bool) -> &'static str {
    if garbage {
        "garbage"
    } else if period >= 4 && score_margin <= 5 {
        "clutch"
    } else if score_margin >= 20 {
        "blowout"
    } else {
        "normal"
    }
}

/// Average team pace over the league baseline.
pub fn pace_multiplier(home_pace: Option<f64>, away_pace: Option<f64>, league_avg: f64) -> f64 {
    match (home_pace, away_pace) {
        (Some(home), Some(away)) if league_avg > 0.0 => {
            round3((home + away) / 2.0 / league_avg)
        }
        _ => 1.0,
    }
}

/// Parse "MM:SS" or ISO-8601 duration ("PT05M30.00S") minutes to a float.
pub fn parse_minutes(raw: &str) -> f64 {
    let raw = raw.trim();
    if raw.is_empty() {
        return 0.0;
    }

    if let Some(rest) = raw.strip_prefix("PT") {
        let minutes = rest
            .split('M')
            .next()
            .and_then(|m| m.parse::<f64>().ok())
            .unwrap_or(0.0);
        let seconds = rest
            .split('M')
            .nth(1)
            .and_then(|s| s.trim_end_matches('S').parse::<f64>().ok())
            .unwrap_or(0.0);
        return minutes + seconds / 60.0;
    }

    if let Some((minutes, seconds)) = raw.split_once(':') {
        let minutes = minutes.parse::<f64>().unwrap_or(0.0);
        let seconds = seconds.parse::<f64>().unwrap_or(0.0);
        return minutes + seconds / 60.0;
    }

    raw.parse().unwrap_or(0.0)
}

fn clock_minutes_remaining(clock: &str) -> f64 {
    parse_minutes(clock)
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn round4(value: f64) -> f64 {
    (value * 10000.0).round() / 10000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pie_matches_reference_line() {
        // 28p 10/20 fg, 6/8 ft, 2 oreb 6 dreb, 9 ast, 2 stl, 1 blk, 3 pf, 3 tov
        let pie = live_pie(28, 10, 20, 6, 8, 2, 6, 9, 2, 1, 3, 3, 100.0);
        assert_eq!(pie, 0.285);
    }

    #[test]
    fn pie_clamps_and_handles_zero_denominator() {
        assert_eq!(live_pie(100, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0.0), 0.0);
        assert_eq!(live_pie(500, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 100.0), 1.0);
        assert_eq!(live_pie(0, 0, 50, 0, 50, 0, 0, 0, 0, 0, 0, 0, 100.0), -0.5);
    }

    #[test]
    fn game_denominator_is_floored_early() {
        let quiet = [TeamTotals { pts: 2, fgm: 1, fga: 2, ..Default::default() }];
        assert_eq!(game_pie_denominator(&quiet), 10.0);

        let busy = [
            TeamTotals { pts: 60, fgm: 24, fga: 50, ftm: 8, fta: 10, tov: 7 },
            TeamTotals { pts: 55, fgm: 22, fga: 48, ftm: 6, fta: 8, tov: 9 },
        ];
        assert!(game_pie_denominator(&busy) > 10.0);
    }

    #[test]
    fn percentile_buckets() {
        assert_eq!(pie_percentile(0.25), 99);
        assert!(pie_percentile(0.16) >= 90);
        assert!((50..75).contains(&pie_percentile(0.10)));
        assert!(pie_percentile(0.01) >= 1);
    }

    #[test]
    fn shooting_efficiency() {
        // 30 pts on 20 fga, 10 fta: TS = 30 / (2*(20+4.4)) = 0.6148
        assert_eq!(true_shooting(30, 20, 10), 0.6148);
        assert_eq!(true_shooting(0, 0, 0), 0.0);
        // 10 fgm with 4 threes on 20 attempts: (10+2)/20 = 0.6
        assert_eq!(effective_fg(10, 4, 20), 0.6);
    }

    #[test]
    fn plus_minus_labels() {
        assert_eq!(plus_minus_per_min(18, 30.0).1, "dominant");
        assert_eq!(plus_minus_per_min(5, 30.0).1, "positive");
        assert_eq!(plus_minus_per_min(-5, 30.0).1, "negative");
        assert_eq!(plus_minus_per_min(-20, 30.0).1, "liability");
        assert_eq!(plus_minus_per_min(10, 0.0).0, 0.0);
    }

    #[test]
    fn fatigue_grows_with_minutes_and_age() {
        assert_eq!(in_game_fatigue_penalty(24.0, 25), 0.03);
        assert_eq!(in_game_fatigue_penalty(24.0, 35), 0.045);
        // Cap at 15%.
        assert_eq!(in_game_fatigue_penalty(400.0, 35), 0.15);
    }

    #[test]
    fn usage_rate_live_formula() {
        // Player: 15 fga, 5 fta, 2 tov in 20 of 36 elapsed minutes.
        // Team: 60 fga, 20 fta, 10 tov.
        let usage = in_game_usage(15, 5, 2, 20.0, 60, 20, 10, 36.0);
        assert!(usage > 0.0 && usage < 100.0);
        assert_eq!(in_game_usage(5, 0, 0, 0.0, 60, 20, 10, 36.0), 0.0);
    }

    #[test]
    fn usage_vacuum_needs_a_real_gap() {
        assert!(usage_vacuum(0.32, Some(0.25)));
        assert!(!usage_vacuum(0.27, Some(0.25)));
        assert!(!usage_vacuum(0.40, None));
    }

    #[test]
    fn matchup_difficulty_tri_threshold() {
        assert_eq!(matchup_difficulty(106.0, 112.0), "elite");
        assert_eq!(matchup_difficulty(118.0, 112.0), "soft");
        assert_eq!(matchup_difficulty(112.5, 112.0), "average");
    }

    #[test]
    fn heat_scale_thresholds() {
        assert_eq!(heat_scale(0.65, Some(0.58)), "hot");
        assert_eq!(heat_scale(0.50, Some(0.58)), "cold");
        assert_eq!(heat_scale(0.60, Some(0.58)), "steady");
        assert_eq!(heat_scale(0.70, None), "steady");
    }

    #[test]
    fn garbage_time_by_period_margin_clock() {
        assert!(is_garbage_time(4, "5:30", 120, 85));
        assert!(is_garbage_time(4, "10:00", 130, 92));
        assert!(!is_garbage_time(4, "10:00", 120, 92));
        assert!(!is_garbage_time(2, "1:00", 80, 40));
        assert!(is_garbage_time(4, "PT03M20.00S", 118, 90));
    }

    #[test]
    fn phase_classification_order() {
        assert_eq!(game_phase(4, 30, true), "garbage");
        assert_eq!(game_phase(4, 3, false), "clutch");
        assert_eq!(game_phase(5, 5, false), "clutch");
        assert_eq!(game_phase(2, 25, false), "blowout");
        assert_eq!(game_phase(3, 10, false), "normal");
    }

    #[test]
    fn pace_multiplier_averages_team_paces() {
        assert_eq!(pace_multiplier(Some(102.0), Some(98.0), 100.0), 1.0);
        assert_eq!(pace_multiplier(Some(110.0), Some(106.0), 100.0), 1.08);
        assert_eq!(pace_multiplier(None, Some(100.0), 100.0), 1.0);
    }

    #[test]
    fn minutes_parsing_formats() {
        assert_eq!(parse_minutes("32:30"), 32.5);
        assert_eq!(parse_minutes("PT05M30.00S"), 5.5);
        assert_eq!(parse_minutes(""), 0.0);
        assert_eq!(parse_minutes("12"), 12.0);
    }
}
