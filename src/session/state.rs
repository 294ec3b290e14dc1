// Draft session aggregate: sign-ups, team rosters, pairings, results, and
// the stage machine that guards every mutation.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::pairings::{self, PairingError, RoundPairings};
use super::results::{team_tally, MatchResult, TeamTally};
use super::ParticipantId;

/// Maximum number of sign-ups per session.
pub const MAX_SIGN_UPS: usize = 8;

/// Alphabet the external drafting service accepts in session tokens.
const DRAFT_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const DRAFT_ID_LEN: usize = 8;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Governs how teams are formed. Fixed at session creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionType {
    Random,
    Premade,
    Swiss,
    Winston,
}

impl SessionType {
    /// Premade sessions are populated by explicit team assignment; every
    /// other type shuffles the sign-up list when teams are formed.
    pub fn manual_teams(self) -> bool {
        matches!(self, SessionType::Premade)
    }
}

/// Position of a session in its lifecycle. Only ever advances forward, or
/// terminates in `Canceled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    SignUp,
    ReadyCheck,
    TeamsFormed,
    Pairing,
    Reporting,
    Completed,
    Canceled,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Canceled)
    }
}

/// A participant's vote during a ready check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadyVote {
    Ready,
    NotReady,
    NoResponse,
}

/// Which team a participant is being assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TeamSide {
    A,
    B,
}

/// Outcome of a team-assignment toggle, for the caller's messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeamAssignment {
    Joined(TeamSide),
    Left(TeamSide),
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Caller-facing validation failures. Guards fail fast and leave the
/// session unchanged; these are reported upward verbatim, never logged as
/// failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("the sign-up list is full")]
    Full,

    #[error("participant is already signed up")]
    AlreadySignedUp,

    #[error("participant is not signed up")]
    NotSignedUp,

    #[error("a ready check was already initiated")]
    AlreadyInitiated,

    #[error("not enough players to form teams")]
    InsufficientPlayers,

    #[error("teams must be the same size ({team_a} vs {team_b})")]
    UnbalancedTeams { team_a: usize, team_b: usize },

    #[error(transparent)]
    UnsupportedPlayerCount(#[from] PairingError),

    #[error("no match numbered {0} in this session")]
    UnknownMatch(u32),

    #[error("operation not allowed in the {stage:?} stage")]
    WrongStage { stage: Stage },

    #[error("{0} matches have no reported winner")]
    MatchesUnreported(usize),

    #[error("pairings were already generated for this team split")]
    PairingsExist,
}

// ---------------------------------------------------------------------------
// DraftSession
// ---------------------------------------------------------------------------

/// One tournament instance, from sign-up through completion.
///
/// All mutation goes through the methods below so the stage machine and the
/// roster invariants are enforced in one place. The registry is the single
/// owner of live instances; concurrent access is serialized by the
/// dispatcher, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftSession {
    /// Opaque unique id; embeds the creation time for ordering.
    pub session_id: String,
    /// Short random token identifying the external drafting session.
    pub draft_id: String,
    pub session_type: SessionType,
    /// The cube the keep-alive connector imports into the drafting session.
    pub cube_id: String,
    /// Participant id -> display name.
    pub sign_ups: BTreeMap<ParticipantId, String>,
    pub team_a: Vec<ParticipantId>,
    pub team_b: Vec<ParticipantId>,
    pub pairings: RoundPairings,
    pub match_results: BTreeMap<u32, MatchResult>,
    pub stage: Stage,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Externally provisioned room ids, kept only for cleanup.
    pub channel_ids: Vec<String>,
    /// Present only while a ready check is running.
    pub ready_status: Option<BTreeMap<ParticipantId, ReadyVote>>,
    /// Next match number to hand out; never reused within a session.
    pub next_match_number: u32,
}

impl DraftSession {
    /// Create a session at an explicit creation time.
    pub fn new(
        creator: &str,
        session_type: SessionType,
        cube_id: &str,
        created_at: DateTime<Utc>,
        ttl: Duration,
        rng: &mut impl Rng,
    ) -> Self {
        DraftSession {
            session_id: format!("{creator}-{}", created_at.timestamp_millis()),
            draft_id: generate_draft_id(rng),
            session_type,
            cube_id: cube_id.to_string(),
            sign_ups: BTreeMap::new(),
            team_a: Vec::new(),
            team_b: Vec::new(),
            pairings: RoundPairings::new(),
            match_results: BTreeMap::new(),
            stage: Stage::SignUp,
            created_at,
            expires_at: created_at + ttl,
            channel_ids: Vec::new(),
            ready_status: None,
            next_match_number: 1,
        }
    }

    /// Create a session starting now, with an unpredictable draft id.
    pub fn open(creator: &str, session_type: SessionType, cube_id: &str, ttl: Duration) -> Self {
        Self::new(
            creator,
            session_type,
            cube_id,
            Utc::now(),
            ttl,
            &mut rand::thread_rng(),
        )
    }

    /// Join link for the external drafting session.
    pub fn draft_link(&self) -> String {
        format!("https://draftmancer.com/?session=DB{}", self.draft_id)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Which team a participant currently sits on, if any.
    pub fn team_of(&self, participant: &str) -> Option<TeamSide> {
        if self.team_a.iter().any(|id| id == participant) {
            Some(TeamSide::A)
        } else if self.team_b.iter().any(|id| id == participant) {
            Some(TeamSide::B)
        } else {
            None
        }
    }

    /// Aggregate match wins per team from the current result snapshot.
    pub fn tally(&self) -> TeamTally {
        team_tally(&self.match_results, &self.team_a, &self.team_b)
    }

    /// Matches that still have no winner.
    pub fn unreported_count(&self) -> usize {
        self.match_results
            .values()
            .filter(|result| !result.is_decided())
            .count()
    }

    // -----------------------------------------------------------------
    // Sign-up phase
    // -----------------------------------------------------------------

    /// Register a participant. Only valid while signing up.
    pub fn sign_up(&mut self, participant: &str, display_name: &str) -> Result<(), SessionError> {
        self.require_stage(&[Stage::SignUp])?;
        if self.sign_ups.len() >= MAX_SIGN_UPS {
            return Err(SessionError::Full);
        }
        if self.sign_ups.contains_key(participant) {
            return Err(SessionError::AlreadySignedUp);
        }
        self.sign_ups
            .insert(participant.to_string(), display_name.to_string());
        Ok(())
    }

    /// Withdraw a participant. Returns `true` when the roster is now empty,
    /// so the caller can apply its cancellation policy.
    pub fn cancel_sign_up(&mut self, participant: &str) -> Result<bool, SessionError> {
        self.require_stage(&[Stage::SignUp, Stage::ReadyCheck])?;
        if self.sign_ups.remove(participant).is_none() {
            return Err(SessionError::NotSignedUp);
        }
        self.team_a.retain(|id| id != participant);
        self.team_b.retain(|id| id != participant);
        if let Some(ready) = &mut self.ready_status {
            ready.remove(participant);
        }
        Ok(self.sign_ups.is_empty())
    }

    // -----------------------------------------------------------------
    // Ready check
    // -----------------------------------------------------------------

    /// Start the ready check, seeding every sign-up as `NoResponse`.
    /// May only be invoked once per session.
    pub fn initiate_ready_check(&mut self) -> Result<(), SessionError> {
        if self.ready_status.is_some() {
            return Err(SessionError::AlreadyInitiated);
        }
        self.require_stage(&[Stage::SignUp])?;
        self.ready_status = Some(
            self.sign_ups
                .keys()
                .map(|id| (id.clone(), ReadyVote::NoResponse))
                .collect(),
        );
        self.stage = Stage::ReadyCheck;
        Ok(())
    }

    pub fn mark_ready(&mut self, participant: &str) -> Result<(), SessionError> {
        self.set_ready_vote(participant, ReadyVote::Ready)
    }

    pub fn mark_not_ready(&mut self, participant: &str) -> Result<(), SessionError> {
        self.set_ready_vote(participant, ReadyVote::NotReady)
    }

    /// Move a participant between the ready buckets. Repeating the same
    /// vote is a no-op.
    fn set_ready_vote(&mut self, participant: &str, vote: ReadyVote) -> Result<(), SessionError> {
        self.require_stage(&[Stage::ReadyCheck])?;
        let ready = self
            .ready_status
            .as_mut()
            .ok_or(SessionError::WrongStage { stage: self.stage })?;
        match ready.get_mut(participant) {
            Some(entry) => {
                *entry = vote;
                Ok(())
            }
            None => Err(SessionError::NotSignedUp),
        }
    }

    // -----------------------------------------------------------------
    // Team formation
    // -----------------------------------------------------------------

    /// Toggle a participant's membership on `side`.
    ///
    /// Clicking the side you are already on removes you from it; clicking
    /// the other side moves you. The sign-up entry is upserted either way.
    /// Valid any time before pairings exist.
    pub fn assign_to_team(
        &mut self,
        participant: &str,
        display_name: &str,
        side: TeamSide,
    ) -> Result<TeamAssignment, SessionError> {
        self.require_stage(&[Stage::SignUp, Stage::ReadyCheck, Stage::TeamsFormed])?;

        let assignment = if self.team_of(participant) == Some(side) {
            self.team_mut(side).retain(|id| id != participant);
            TeamAssignment::Left(side)
        } else {
            self.team_mut(side.opposite()).retain(|id| id != participant);
            self.team_mut(side).push(participant.to_string());
            TeamAssignment::Joined(side)
        };

        self.sign_ups
            .insert(participant.to_string(), display_name.to_string());
        Ok(assignment)
    }

    /// Lock in the two teams and advance to `TeamsFormed`.
    ///
    /// Non-premade types shuffle the sign-up list and split it into two
    /// halves (the larger half on team B when odd). Premade sessions only
    /// validate the manually assigned teams.
    pub fn form_teams(&mut self, rng: &mut impl Rng) -> Result<(), SessionError> {
        self.require_stage(&[Stage::SignUp, Stage::ReadyCheck])?;
        if self.sign_ups.len() < 2 {
            return Err(SessionError::InsufficientPlayers);
        }

        if self.session_type.manual_teams() {
            if self.team_a.len() + self.team_b.len() < 2 {
                return Err(SessionError::InsufficientPlayers);
            }
            if self.team_a.len() != self.team_b.len() {
                return Err(SessionError::UnbalancedTeams {
                    team_a: self.team_a.len(),
                    team_b: self.team_b.len(),
                });
            }
        } else {
            let mut participants: Vec<ParticipantId> = self.sign_ups.keys().cloned().collect();
            participants.shuffle(rng);
            let mid = participants.len() / 2;
            self.team_b = participants.split_off(mid);
            self.team_a = participants;
        }

        self.ready_status = None;
        self.stage = Stage::TeamsFormed;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Pairings and results
    // -----------------------------------------------------------------

    /// Generate the 3-round schedule and seed an unplayed result per match.
    ///
    /// Fails without touching the session if the team sizes are not
    /// supported. Match numbers continue from any prior numbering.
    pub fn generate_pairings(&mut self) -> Result<(), SessionError> {
        self.require_stage(&[Stage::TeamsFormed])?;
        if !self.pairings.is_empty() {
            return Err(SessionError::PairingsExist);
        }

        let (rounds, next_match_number) =
            pairings::generate(&self.team_a, &self.team_b, self.next_match_number)?;

        for pairing in rounds.values().flatten() {
            self.match_results.insert(
                pairing.match_number,
                MatchResult::new(pairing.player.clone(), pairing.opponent.clone()),
            );
        }
        self.pairings = rounds;
        self.next_match_number = next_match_number;
        self.stage = Stage::Pairing;
        Ok(())
    }

    /// Record (or re-record) a match score. The first report moves the
    /// session into `Reporting`.
    pub fn report_result(
        &mut self,
        match_number: u32,
        player1_wins: u8,
        player2_wins: u8,
    ) -> Result<(), SessionError> {
        self.require_stage(&[Stage::Pairing, Stage::Reporting])?;
        let result = self
            .match_results
            .get_mut(&match_number)
            .ok_or(SessionError::UnknownMatch(match_number))?;
        result.record(player1_wins, player2_wins);
        self.stage = Stage::Reporting;
        Ok(())
    }

    /// Close out the session once every match has a winner, or
    /// unconditionally when `force` is set.
    pub fn complete(&mut self, force: bool) -> Result<(), SessionError> {
        self.require_stage(&[Stage::Pairing, Stage::Reporting])?;
        let unreported = self.unreported_count();
        if unreported > 0 && !force {
            return Err(SessionError::MatchesUnreported(unreported));
        }
        self.stage = Stage::Completed;
        Ok(())
    }

    /// Terminate the session from any non-terminal stage.
    pub fn cancel(&mut self) -> Result<(), SessionError> {
        if self.stage.is_terminal() {
            return Err(SessionError::WrongStage { stage: self.stage });
        }
        self.stage = Stage::Canceled;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------

    fn require_stage(&self, allowed: &[Stage]) -> Result<(), SessionError> {
        if allowed.contains(&self.stage) {
            Ok(())
        } else {
            Err(SessionError::WrongStage { stage: self.stage })
        }
    }

    fn team_mut(&mut self, side: TeamSide) -> &mut Vec<ParticipantId> {
        match side {
            TeamSide::A => &mut self.team_a,
            TeamSide::B => &mut self.team_b,
        }
    }
}

impl TeamSide {
    pub fn opposite(self) -> TeamSide {
        match self {
            TeamSide::A => TeamSide::B,
            TeamSide::B => TeamSide::A,
        }
    }
}

/// Generate a short random session token for the drafting service.
pub fn generate_draft_id(rng: &mut impl Rng) -> String {
    (0..DRAFT_ID_LEN)
        .map(|_| DRAFT_ID_ALPHABET[rng.gen_range(0..DRAFT_ID_ALPHABET.len())] as char)
        .collect()
}
