// Round-robin pairing math for team drafts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ParticipantId;

/// Number of rounds every team draft plays, regardless of team size.
pub const ROUNDS: u8 = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PairingError {
    #[error("unsupported player count: {0} (team drafts need 6 or 8 players)")]
    UnsupportedPlayerCount(usize),
}

/// A single scheduled match between one player per team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pairing {
    /// The team-A player.
    pub player: ParticipantId,
    /// The team-B opponent.
    pub opponent: ParticipantId,
    /// Session-wide unique match number.
    pub match_number: u32,
}

/// Round number -> ordered pairings for that round.
pub type RoundPairings = BTreeMap<u8, Vec<Pairing>>;

/// Generate the fixed 3-round schedule for two equal teams.
///
/// Round 1 pairs `team_a[i]` with `team_b[i]`; each later round rotates
/// team B left by one position before re-pairing index-wise, so round `r`
/// pairs `team_a[i]` with `team_b[(i + r - 1) % n]`. Every team-A player
/// therefore meets a distinct opponent in each round.
///
/// Match numbers increase strictly from `starting_match_number`; the second
/// tuple element is the first unused number, so a caller re-pairing after a
/// team change never reuses numbers. Output is deterministic given input
/// order; shuffle the rosters beforehand if unpredictability is wanted.
pub fn generate(
    team_a: &[ParticipantId],
    team_b: &[ParticipantId],
    starting_match_number: u32,
) -> Result<(RoundPairings, u32), PairingError> {
    let n = team_a.len();
    if n != team_b.len() || !(n == 3 || n == 4) {
        return Err(PairingError::UnsupportedPlayerCount(
            team_a.len() + team_b.len(),
        ));
    }

    let mut rounds = RoundPairings::new();
    let mut match_number = starting_match_number;

    for round in 1..=ROUNDS {
        let offset = usize::from(round) - 1;
        let mut round_pairings = Vec::with_capacity(n);
        for i in 0..n {
            round_pairings.push(Pairing {
                player: team_a[i].clone(),
                opponent: team_b[(i + offset) % n].clone(),
                match_number,
            });
            match_number += 1;
        }
        rounds.insert(round, round_pairings);
    }

    Ok((rounds, match_number))
}
