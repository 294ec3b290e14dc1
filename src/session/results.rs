// Match results and team tally aggregation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ParticipantId;

/// The reported outcome of one scheduled match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    pub player1_id: ParticipantId,
    pub player2_id: ParticipantId,
    pub player1_wins: u8,
    pub player2_wins: u8,
    /// Set only once a side's wins exceed the other's.
    pub winner_id: Option<ParticipantId>,
}

impl MatchResult {
    /// A fresh, unplayed match between two players.
    pub fn new(player1_id: ParticipantId, player2_id: ParticipantId) -> Self {
        MatchResult {
            player1_id,
            player2_id,
            player1_wins: 0,
            player2_wins: 0,
            winner_id: None,
        }
    }

    /// Record a score, replacing any previous report.
    ///
    /// The winner is whichever side's wins exceed the other's. An equal
    /// report (including 0-0, meaning "no match played") clears the winner.
    pub fn record(&mut self, player1_wins: u8, player2_wins: u8) {
        self.player1_wins = player1_wins;
        self.player2_wins = player2_wins;
        self.winner_id = match player1_wins.cmp(&player2_wins) {
            std::cmp::Ordering::Greater => Some(self.player1_id.clone()),
            std::cmp::Ordering::Less => Some(self.player2_id.clone()),
            std::cmp::Ordering::Equal => None,
        };
    }

    /// Whether one side has won this match.
    pub fn is_decided(&self) -> bool {
        self.winner_id.is_some()
    }

    /// Whether any games were reported at all.
    pub fn is_played(&self) -> bool {
        self.player1_wins > 0 || self.player2_wins > 0
    }
}

/// Per-draft outcome between the two teams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DraftOutcome {
    TeamA,
    TeamB,
    Tie,
}

/// Aggregated match wins per team.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamTally {
    pub team_a_wins: u32,
    pub team_b_wins: u32,
    /// Matches that were played to an equal score. Unplayed matches are
    /// counted nowhere.
    pub draws: u32,
}

impl TeamTally {
    pub fn outcome(&self) -> DraftOutcome {
        match self.team_a_wins.cmp(&self.team_b_wins) {
            std::cmp::Ordering::Greater => DraftOutcome::TeamA,
            std::cmp::Ordering::Less => DraftOutcome::TeamB,
            std::cmp::Ordering::Equal => DraftOutcome::Tie,
        }
    }

    /// Team A's share of decided matches, or of all resolved matches when
    /// `count_draws` is set. `None` when nothing qualifies yet.
    pub fn win_percentage(&self, count_draws: bool) -> Option<f64> {
        let decided = self.team_a_wins + self.team_b_wins;
        let denominator = if count_draws {
            decided + self.draws
        } else {
            decided
        };
        if denominator == 0 {
            return None;
        }
        Some(f64::from(self.team_a_wins) / f64::from(denominator))
    }
}

/// Tally decided matches per team from a result snapshot.
///
/// Each decided match credits one win to whichever team contains the
/// winner. This is pure and replay-safe: the same snapshot always yields
/// the same tally.
pub fn team_tally(
    results: &BTreeMap<u32, MatchResult>,
    team_a: &[ParticipantId],
    team_b: &[ParticipantId],
) -> TeamTally {
    let mut tally = TeamTally::default();
    for result in results.values() {
        match &result.winner_id {
            Some(winner) if team_a.contains(winner) => tally.team_a_wins += 1,
            Some(winner) if team_b.contains(winner) => tally.team_b_wins += 1,
            Some(_) => {}
            None if result.is_played() => tally.draws += 1,
            None => {}
        }
    }
    tally
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(prefix: &str, size: usize) -> Vec<ParticipantId> {
        (0..size).map(|i| format!("{prefix}{i}")).collect()
    }

    fn reported(p1: &str, p2: &str, wins1: u8, wins2: u8) -> MatchResult {
        let mut result = MatchResult::new(p1.to_string(), p2.to_string());
        result.record(wins1, wins2);
        result
    }

    #[test]
    fn record_sets_winner_for_either_side() {
        let mut result = MatchResult::new("a0".into(), "b0".into());
        result.record(2, 0);
        assert_eq!(result.winner_id.as_deref(), Some("a0"));
        result.record(1, 2);
        assert_eq!(result.winner_id.as_deref(), Some("b0"));
    }

    #[test]
    fn equal_report_clears_previous_winner() {
        let mut result = MatchResult::new("a0".into(), "b0".into());
        result.record(2, 0);
        assert!(result.is_decided());
        result.record(0, 0);
        assert_eq!(result.winner_id, None);
        assert!(!result.is_played());
    }

    #[test]
    fn tally_attributes_wins_to_teams() {
        let team_a = ids("a", 3);
        let team_b = ids("b", 3);
        let mut results = BTreeMap::new();
        results.insert(1, reported("a0", "b0", 2, 1));
        results.insert(2, reported("a1", "b1", 0, 2));
        results.insert(3, reported("a2", "b2", 2, 0));
        let tally = team_tally(&results, &team_a, &team_b);
        assert_eq!(tally.team_a_wins, 2);
        assert_eq!(tally.team_b_wins, 1);
        assert_eq!(tally.draws, 0);
        assert_eq!(tally.outcome(), DraftOutcome::TeamA);
    }

    #[test]
    fn played_ties_count_as_draws_unplayed_count_nowhere() {
        let team_a = ids("a", 3);
        let team_b = ids("b", 3);
        let mut results = BTreeMap::new();
        results.insert(1, reported("a0", "b0", 1, 1));
        results.insert(2, MatchResult::new("a1".into(), "b1".into()));
        results.insert(3, reported("a2", "b2", 2, 1));
        let tally = team_tally(&results, &team_a, &team_b);
        assert_eq!(tally.team_a_wins, 1);
        assert_eq!(tally.team_b_wins, 0);
        assert_eq!(tally.draws, 1);
    }

    #[test]
    fn tally_is_idempotent() {
        let team_a = ids("a", 4);
        let team_b = ids("b", 4);
        let mut results = BTreeMap::new();
        results.insert(1, reported("a0", "b0", 2, 1));
        results.insert(2, reported("a1", "b1", 1, 1));
        results.insert(3, reported("a2", "b2", 0, 2));
        let first = team_tally(&results, &team_a, &team_b);
        let second = team_tally(&results, &team_a, &team_b);
        assert_eq!(first, second);
    }

    #[test]
    fn tie_outcome_when_wins_equal() {
        let team_a = ids("a", 3);
        let team_b = ids("b", 3);
        let mut results = BTreeMap::new();
        results.insert(1, reported("a0", "b0", 2, 0));
        results.insert(2, reported("a1", "b1", 0, 2));
        let tally = team_tally(&results, &team_a, &team_b);
        assert_eq!(tally.outcome(), DraftOutcome::Tie);
    }

    #[test]
    fn win_percentage_excludes_draws_by_default() {
        let tally = TeamTally {
            team_a_wins: 3,
            team_b_wins: 1,
            draws: 4,
        };
        assert_eq!(tally.win_percentage(false), Some(0.75));
        assert_eq!(tally.win_percentage(true), Some(0.375));
    }

    #[test]
    fn win_percentage_none_when_nothing_decided() {
        let tally = TeamTally::default();
        assert_eq!(tally.win_percentage(false), None);
        assert_eq!(tally.win_percentage(true), None);
    }
}
